//! Applications projection

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::application;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct ApplicationsProjection {
    pool: PgPool,
}

impl ApplicationsProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_state(&self, event: &StoredEvent, state: &str) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE applications SET state = $4, sequence = $3, updated_at = $5
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

    async fn redirect_uris(
        &self,
        event: &StoredEvent,
    ) -> Result<Vec<String>, ProjectionError> {
        let current: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT redirect_uris FROM applications WHERE instance_id = $1 AND id = $2",
        )
        .bind(&event.instance_id)
        .bind(&event.aggregate_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(current
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default())
    }

    async fn write_redirect_uris(
        &self,
        event: &StoredEvent,
        uris: &[String],
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE applications SET redirect_uris = $4, sequence = $3, updated_at = $5
            WHERE instance_id = $1 AND id = $2 AND sequence < $3
            "#,
        )
        .bind(&event.instance_id)
        .bind(&event.aggregate_id)
        .bind(event.aggregate_version)
        .bind(serde_json::to_value(uris)?)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Projection for ApplicationsProjection {
    fn name(&self) -> &'static str {
        "applications"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                instance_id TEXT NOT NULL,
                id TEXT NOT NULL,
                resource_owner TEXT NOT NULL,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                client_id TEXT,
                redirect_uris JSONB NOT NULL DEFAULT '[]',
                response_types JSONB NOT NULL DEFAULT '[]',
                grant_types JSONB NOT NULL DEFAULT '[]',
                auth_method TEXT,
                state TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS applications_client_id_idx ON applications (instance_id, client_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != application::AGGREGATE_TYPE {
            return Ok(());
        }
        match event.event_type.as_str() {
            application::ADDED => {
                let payload: application::AppAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO applications
                        (instance_id, id, resource_owner, project_id, name, state, sequence, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $7)
                    ON CONFLICT (instance_id, id) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&event.owner)
                .bind(&payload.project_id)
                .bind(&payload.name)
                .bind(event.aggregate_version)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            application::OIDC_CONFIG_ADDED => {
                let payload: application::OidcConfigAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE applications SET
                        client_id = $4,
                        redirect_uris = $5,
                        response_types = $6,
                        grant_types = $7,
                        auth_method = $8,
                        sequence = $3,
                        updated_at = $9
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(&payload.client_id)
                .bind(serde_json::to_value(&payload.redirect_uris)?)
                .bind(serde_json::to_value(&payload.response_types)?)
                .bind(serde_json::to_value(&payload.grant_types)?)
                .bind(&payload.auth_method)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            application::OIDC_CONFIG_CHANGED => {
                let payload: application::OidcConfigChangedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE applications SET
                        redirect_uris = COALESCE($4, redirect_uris),
                        response_types = COALESCE($5, response_types),
                        grant_types = COALESCE($6, grant_types),
                        auth_method = COALESCE($7, auth_method),
                        sequence = $3,
                        updated_at = $8
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(payload.redirect_uris.map(serde_json::Value::from))
                .bind(payload.response_types.map(serde_json::Value::from))
                .bind(payload.grant_types.map(serde_json::Value::from))
                .bind(&payload.auth_method)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            application::REDIRECT_URI_ADDED => {
                let payload: application::RedirectUriPayload = decode(event)?;
                let mut uris = self.redirect_uris(event).await?;
                if !uris.contains(&payload.uri) {
                    uris.push(payload.uri);
                }
                self.write_redirect_uris(event, &uris).await?;
            }
            application::REDIRECT_URI_REMOVED => {
                let payload: application::RedirectUriPayload = decode(event)?;
                let mut uris = self.redirect_uris(event).await?;
                uris.retain(|u| *u != payload.uri);
                self.write_redirect_uris(event, &uris).await?;
            }
            application::DEACTIVATED => self.set_state(event, "inactive").await?,
            application::REACTIVATED => self.set_state(event, "active").await?,
            application::REMOVED => self.set_state(event, "removed").await?,
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM applications WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
