//! IDPs projection

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::idp;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct IdpsProjection {
    pool: PgPool,
}

impl IdpsProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_state(&self, event: &StoredEvent, state: &str) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE idps SET state = $4, sequence = $3, updated_at = $5
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
impl Projection for IdpsProjection {
    fn name(&self) -> &'static str {
        "idps"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idps (
                instance_id TEXT NOT NULL,
                id TEXT NOT NULL,
                resource_owner TEXT NOT NULL,
                name TEXT NOT NULL,
                provider TEXT NOT NULL,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                is_creation_allowed BOOLEAN NOT NULL,
                is_linking_allowed BOOLEAN NOT NULL,
                is_auto_creation BOOLEAN NOT NULL,
                is_auto_update BOOLEAN NOT NULL,
                config JSONB NOT NULL DEFAULT '{}',
                sequence BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idps_owner_idx ON idps (instance_id, resource_owner)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != idp::AGGREGATE_TYPE {
            return Ok(());
        }

        if let Some((_, provider)) = idp::ADDED_TYPES
            .iter()
            .find(|(added_type, _)| *added_type == event.event_type)
        {
            let payload: idp::IdpAddedPayload = decode(event)?;
            sqlx::query(
                r#"
                INSERT INTO idps
                    (instance_id, id, resource_owner, name, provider, kind, state,
                     is_creation_allowed, is_linking_allowed, is_auto_creation, is_auto_update,
                     config, sequence, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (instance_id, id) DO NOTHING
                "#,
            )
            .bind(&event.instance_id)
            .bind(&event.aggregate_id)
            .bind(&event.owner)
            .bind(&payload.common.name)
            .bind(provider)
            .bind(payload.kind.kind_name())
            .bind(payload.common.is_creation_allowed)
            .bind(payload.common.is_linking_allowed)
            .bind(payload.common.is_auto_creation)
            .bind(payload.common.is_auto_update)
            .bind(serde_json::to_value(&payload.kind)?)
            .bind(event.aggregate_version)
            .bind(event.created_at)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        match event.event_type.as_str() {
            idp::CHANGED => {
                let payload: idp::IdpChangedPayload = decode(event)?;
                let config = payload
                    .config
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?;
                sqlx::query(
                    r#"
                    UPDATE idps SET
                        name = COALESCE($4, name),
                        is_creation_allowed = COALESCE($5, is_creation_allowed),
                        is_linking_allowed = COALESCE($6, is_linking_allowed),
                        is_auto_creation = COALESCE($7, is_auto_creation),
                        is_auto_update = COALESCE($8, is_auto_update),
                        config = COALESCE($9, config),
                        sequence = $3,
                        updated_at = $10
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(&payload.name)
                .bind(payload.is_creation_allowed)
                .bind(payload.is_linking_allowed)
                .bind(payload.is_auto_creation)
                .bind(payload.is_auto_update)
                .bind(config)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            idp::DEACTIVATED => self.set_state(event, "inactive").await?,
            idp::REACTIVATED => self.set_state(event, "active").await?,
            idp::REMOVED => self.set_state(event, "removed").await?,
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM idps WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
