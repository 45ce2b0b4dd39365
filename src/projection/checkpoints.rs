//! Checkpoint storage (PostgreSQL)
//!
//! One row per `(projection, instance)`; advances only after a batch entry
//! was applied. Events that keep failing land in `failed_events` with their
//! error, so the log never blocks behind a poison event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::event_store::{EventPosition, StoredEvent};

use super::{Checkpoint, CheckpointStatus, Checkpoints, ProjectionError};

#[derive(Debug, Clone)]
pub struct PgCheckpoints {
    pool: PgPool,
}

impl PgCheckpoints {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Checkpoints for PgCheckpoints {
    async fn init(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_checkpoints (
                projection_name TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                position BIGINT NOT NULL DEFAULT 0,
                in_tx_order BIGINT NOT NULL DEFAULT 0,
                event_timestamp TIMESTAMPTZ,
                last_run_at TIMESTAMPTZ,
                status TEXT NOT NULL DEFAULT 'running',
                PRIMARY KEY (projection_name, instance_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_events (
                projection_name TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                position BIGINT NOT NULL,
                in_tx_order BIGINT NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                error TEXT NOT NULL,
                attempts INT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (projection_name, instance_id, position, in_tx_order)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(
        &self,
        projection: &str,
        instance_id: &str,
    ) -> Result<EventPosition, ProjectionError> {
        let row = sqlx::query(
            r#"
            SELECT position, in_tx_order FROM projection_checkpoints
            WHERE projection_name = $1 AND instance_id = $2
            "#,
        )
        .bind(projection)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| EventPosition::new(r.get::<i64, _>("position"), r.get::<i64, _>("in_tx_order")))
            .unwrap_or_else(EventPosition::zero))
    }

    async fn advance(
        &self,
        projection: &str,
        event: &StoredEvent,
        status: CheckpointStatus,
    ) -> Result<(), ProjectionError> {
        // Monotonic: never move the cursor backwards
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints
                (projection_name, instance_id, position, in_tx_order, event_timestamp, last_run_at, status)
            VALUES ($1, $2, $3, $4, $5, NOW(), $6)
            ON CONFLICT (projection_name, instance_id) DO UPDATE SET
                position = EXCLUDED.position,
                in_tx_order = EXCLUDED.in_tx_order,
                event_timestamp = EXCLUDED.event_timestamp,
                last_run_at = NOW(),
                status = EXCLUDED.status
            WHERE (projection_checkpoints.position, projection_checkpoints.in_tx_order)
                < (EXCLUDED.position, EXCLUDED.in_tx_order)
            "#,
        )
        .bind(projection)
        .bind(&event.instance_id)
        .bind(event.position.position)
        .bind(event.position.in_tx_order)
        .bind(event.created_at)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn park_failed(
        &self,
        projection: &str,
        event: &StoredEvent,
        error: &str,
        attempts: u32,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO failed_events
                (projection_name, instance_id, position, in_tx_order,
                 aggregate_type, aggregate_id, event_type, payload, error, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (projection_name, instance_id, position, in_tx_order) DO UPDATE SET
                error = EXCLUDED.error,
                attempts = EXCLUDED.attempts,
                failed_at = NOW()
            "#,
        )
        .bind(projection)
        .bind(&event.instance_id)
        .bind(event.position.position)
        .bind(event.position.in_tx_order)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(error)
        .bind(attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset(&self, projection: &str, instance_id: &str) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            DELETE FROM projection_checkpoints
            WHERE projection_name = $1 AND instance_id = $2
            "#,
        )
        .bind(projection)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Checkpoint>, ProjectionError> {
        let rows = sqlx::query(
            r#"
            SELECT projection_name, instance_id, position, in_tx_order,
                   event_timestamp, last_run_at, status
            FROM projection_checkpoints
            ORDER BY projection_name, instance_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Checkpoint {
                projection: r.get("projection_name"),
                instance_id: r.get("instance_id"),
                position: EventPosition::new(
                    r.get::<i64, _>("position"),
                    r.get::<i64, _>("in_tx_order"),
                ),
                event_timestamp: r.get::<Option<DateTime<Utc>>, _>("event_timestamp"),
                last_run_at: r.get::<Option<DateTime<Utc>>, _>("last_run_at"),
                status: CheckpointStatus::parse(r.get::<String, _>("status").as_str()),
            })
            .collect())
    }
}
