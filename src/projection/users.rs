//! Users projection
//!
//! Keeps one row per user; removal marks the row rather than deleting it,
//! so searches can still explain what happened to an id.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::aggregate::user;
use crate::event_store::StoredEvent;

use super::{decode, Projection, ProjectionError};

#[derive(Debug, Clone)]
pub struct UsersProjection {
    pool: PgPool,
}

impl UsersProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Projection for UsersProjection {
    fn name(&self) -> &'static str {
        "users"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                instance_id TEXT NOT NULL,
                id TEXT NOT NULL,
                resource_owner TEXT NOT NULL,
                username TEXT NOT NULL,
                email TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                display_name TEXT,
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
            "CREATE INDEX IF NOT EXISTS users_owner_idx ON users (instance_id, resource_owner)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != user::AGGREGATE_TYPE {
            return Ok(());
        }
        match event.event_type.as_str() {
            user::HUMAN_ADDED => {
                let payload: user::HumanAddedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    INSERT INTO users (
                        instance_id, id, resource_owner, username, email,
                        first_name, last_name, display_name, state, sequence,
                        created_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active', $9, $10, $10)
                    ON CONFLICT (instance_id, id) DO NOTHING
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&event.owner)
                .bind(&payload.username)
                .bind(&payload.email)
                .bind(&payload.first_name)
                .bind(&payload.last_name)
                .bind(&payload.display_name)
                .bind(event.aggregate_version)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            user::PROFILE_CHANGED => {
                let payload: user::ProfileChangedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE users SET
                        email = COALESCE($4, email),
                        first_name = COALESCE($5, first_name),
                        last_name = COALESCE($6, last_name),
                        display_name = COALESCE($7, display_name),
                        sequence = $3,
                        updated_at = $8
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(&payload.email)
                .bind(&payload.first_name)
                .bind(&payload.last_name)
                .bind(&payload.display_name)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            user::USERNAME_CHANGED => {
                let payload: user::UsernameChangedPayload = decode(event)?;
                sqlx::query(
                    r#"
                    UPDATE users SET username = $4, sequence = $3, updated_at = $5
                    WHERE instance_id = $1 AND id = $2 AND sequence < $3
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(event.aggregate_version)
                .bind(&payload.username)
                .bind(event.created_at)
                .execute(&self.pool)
                .await?;
            }
            user::DEACTIVATED | user::REACTIVATED | user::REMOVED => {
                let state = match event.event_type.as_str() {
                    user::DEACTIVATED => "inactive",
                    user::REACTIVATED => "active",
                    _ => "removed",
                };
                sqlx::query(
                    r#"
                    UPDATE users SET state = $4, sequence = $3, updated_at = $5
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
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM users WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
