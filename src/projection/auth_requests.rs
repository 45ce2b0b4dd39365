//! Auth-requests projection
//!
//! Read side of the interactive flow, used by login UIs to show progress
//! and by operators to audit failed logins.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::auth_request;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct AuthRequestsProjection {
    pool: PgPool,
}

impl AuthRequestsProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_state(&self, event: &StoredEvent, state: &str) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE auth_requests SET state = $4, sequence = $3, updated_at = $5
            WHERE instance_id = $1 AND id = $2 AND sequence < $3
            "#,
        )
        .bind(&event.instance_id)
        .bind(&event.aggregate_id)
        .bind(event.aggregate_version)
        .bind(state)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Projection for AuthRequestsProjection {
    fn name(&self) -> &'static str {
        "auth_requests"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_requests (
                instance_id TEXT NOT NULL,
                id TEXT NOT NULL,
                resource_owner TEXT NOT NULL,
                client_id TEXT NOT NULL,
                scope JSONB NOT NULL DEFAULT '[]',
                state TEXT NOT NULL,
                selected_user_id TEXT,
                failure_reason TEXT,
                sequence BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != auth_request::AGGREGATE_TYPE {
            return Ok(());
        }
        match event.event_type.as_str() {
            auth_request::ADDED => {
                let payload: auth_request::AuthRequestAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO auth_requests
                        (instance_id, id, resource_owner, client_id, scope, state, sequence, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, 'initial', $6, $7, $7)
                    ON CONFLICT (instance_id, id) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&event.owner)
                .bind(&payload.client_id)
                .bind(serde_json::to_value(&payload.scope)?)
                .bind(event.aggregate_version)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            auth_request::USER_SELECTED => {
                let payload: auth_request::UserSelectedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE auth_requests
                    SET state = 'user_selected', selected_user_id = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(&payload.user_id)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            auth_request::SUCCEEDED => self.set_state(event, "succeeded").await?,
            auth_request::FAILED => {
                let payload: auth_request::FailedPayload = decode(event)?;
                let reason = serde_json::to_value(payload.reason)?;
                let reason = reason.as_str().unwrap_or("unknown").to_string();
                sqlx::query(
                    r#"
                    UPDATE auth_requests
                    SET state = 'failed', failure_reason = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(reason)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            auth_request::PASSWORD_CHECKED
            | auth_request::PASSWORD_CHECK_FAILED
            | auth_request::TOTP_CHECKED
            | auth_request::TOTP_CHECK_FAILED
            | auth_request::CODE_EXCHANGED => {
                sqlx::query(
                    r#"
                    UPDATE auth_requests SET sequence = $3, updated_at = $4
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM auth_requests WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
