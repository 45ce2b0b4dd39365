//! Tokens projection
//!
//! Search side for token administration; introspection itself reads the
//! write model for strong consistency.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::token;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct TokensProjection {
    pool: PgPool,
}

impl TokensProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Projection for TokensProjection {
    fn name(&self) -> &'static str {
        "tokens"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                instance_id TEXT NOT NULL,
                id TEXT NOT NULL,
                resource_owner TEXT NOT NULL,
                token_type TEXT NOT NULL,
                client_id TEXT NOT NULL,
                user_id TEXT,
                scope JSONB NOT NULL DEFAULT '[]',
                audience JSONB NOT NULL DEFAULT '[]',
                issued_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                dpop_jkt TEXT,
                revoked_at TIMESTAMPTZ,
                revoked_by TEXT,
                sequence BIGINT NOT NULL,
                PRIMARY KEY (instance_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS tokens_user_idx ON tokens (instance_id, user_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != token::AGGREGATE_TYPE {
            return Ok(());
        }
        match event.event_type.as_str() {
            token::ADDED => {
                let payload: token::TokenAddedPayload = decode(event)?;
                let token_type = match payload.token_type {
                    token::TokenType::Access => "access",
                    token::TokenType::Refresh => "refresh",
                };
                sqlx::query(
                    r#"
                    INSERT INTO tokens
                        (instance_id, id, resource_owner, token_type, client_id, user_id,
                         scope, audience, issued_at, expires_at, dpop_jkt, sequence)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    ON CONFLICT (instance_id, id) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&event.owner)
                .bind(token_type)
                .bind(&payload.client_id)
                .bind(&payload.user_id)
                .bind(serde_json::to_value(&payload.scope)?)
                .bind(serde_json::to_value(&payload.audience)?)
                .bind(payload.issued_at)
                .bind(payload.expires_at)
                .bind(&payload.dpop_jkt)
                .bind(event.aggregate_version)
                .execute(&self.pool)
                .await?;
            }
            token::REVOKED => {
                let payload: token::TokenRevokedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE tokens SET revoked_at = $4, revoked_by = $5, sequence = $3
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(payload.revoked_at)
                .bind(&payload.revoked_by)
                .execute(&self.pool)
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM tokens WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
