//! Device-authorizations projection
//!
//! Backs the user-facing verification page: lookup by user code, client
//! display and current state.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::device_auth;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct DeviceAuthsProjection {
    pool: PgPool,
}

impl DeviceAuthsProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_state(&self, event: &StoredEvent, state: &str) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE device_auths SET state = $4, sequence = $3, updated_at = $5
            WHERE instance_id = $1 AND device_code = $2 AND sequence < $3
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
impl Projection for DeviceAuthsProjection {
    fn name(&self) -> &'static str {
        "device_auths"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_auths (
                instance_id TEXT NOT NULL,
                device_code TEXT NOT NULL,
                user_code TEXT NOT NULL,
                client_id TEXT NOT NULL,
                scope JSONB NOT NULL DEFAULT '[]',
                state TEXT NOT NULL,
                approved_user_id TEXT,
                expires_at TIMESTAMPTZ NOT NULL,
                sequence BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, device_code)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS device_auths_user_code_idx ON device_auths (instance_id, user_code)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != device_auth::AGGREGATE_TYPE {
            return Ok(());
        }
        match event.event_type.as_str() {
            device_auth::ADDED => {
                let payload: device_auth::DeviceAuthAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO device_auths
                        (instance_id, device_code, user_code, client_id, scope, state, expires_at, sequence, updated_at)
                    VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8)
                    ON CONFLICT (instance_id, device_code) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&payload.user_code)
                .bind(&payload.client_id)
                .bind(serde_json::to_value(&payload.scope)?)
                .bind(payload.expires_at)
                .bind(event.aggregate_version)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            device_auth::APPROVED => {
                let payload: device_auth::DecisionPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE device_auths
                    SET state = 'approved', approved_user_id = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND device_code = $2 AND sequence < $3
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
            device_auth::DENIED => self.set_state(event, "denied").await?,
            device_auth::CANCELLED => self.set_state(event, "cancelled").await?,
            device_auth::EXPIRED => self.set_state(event, "expired").await?,
            device_auth::COMPLETED => self.set_state(event, "completed").await?,
            device_auth::POLLED => {
                sqlx::query(
                    r#"
                    UPDATE device_auths SET sequence = $3, updated_at = $4
                    WHERE instance_id = $1 AND device_code = $2 AND sequence < $3
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
        sqlx::query("DELETE FROM device_auths WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
