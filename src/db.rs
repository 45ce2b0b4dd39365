//! Database module
//!
//! Pool construction and the idempotent core schema (event log, unique
//! constraints, position sequence). Projection tables are created by each
//! projection's `init`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

/// Connect a pool using the configured limits
pub async fn connect(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
}

/// Create the event-store schema if absent
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            instance_id TEXT NOT NULL,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            aggregate_version BIGINT NOT NULL,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            creator TEXT NOT NULL,
            owner TEXT NOT NULL,
            position BIGINT NOT NULL,
            in_tx_order BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            revision SMALLINT NOT NULL DEFAULT 1,
            PRIMARY KEY (instance_id, aggregate_type, aggregate_id, aggregate_version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS events_position_idx ON events (instance_id, position, in_tx_order)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS events_type_idx ON events (instance_id, aggregate_type, event_type)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE SEQUENCE IF NOT EXISTS events_position_seq")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unique_constraints (
            instance_id TEXT NOT NULL,
            constraint_name TEXT NOT NULL,
            constraint_value TEXT NOT NULL,
            PRIMARY KEY (instance_id, constraint_name, constraint_value)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Simple connectivity check
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
