//! Common test utilities

// Each integration-test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::sync::Arc;

use castellan::command::{CommandConfig, Commands};
use castellan::event_store::MemoryEventStore;
use castellan::Context;

/// Commands over a fresh in-memory event store
pub fn memory_commands() -> (Commands, Arc<MemoryEventStore>) {
    let store = Arc::new(MemoryEventStore::new());
    let commands = Commands::new(store.clone(), CommandConfig::default());
    (commands, store)
}

/// Admin context in the test instance
pub fn admin_ctx() -> Context {
    Context::new("inst-1").with_user("admin")
}

/// Connect to the database named by DATABASE_URL; panics when unset, so
/// only the `#[ignore]`d integration tests may call this.
pub async fn setup_test_db() -> sqlx::PgPool {
    dotenvy::dotenv().ok();
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for DB tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    castellan::db::init_schema(&pool).await.expect("init schema");

    sqlx::query("TRUNCATE TABLE events, unique_constraints CASCADE")
        .execute(&pool)
        .await
        .expect("Failed to clean up DB");

    pool
}
