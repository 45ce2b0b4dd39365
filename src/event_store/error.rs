//! Event store errors

/// Errors raised by event store backends
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("concurrent modification of {aggregate_type} {aggregate_id}: expected version {expected}, found {actual}")]
    OptimisticConcurrency {
        aggregate_type: String,
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("unique constraint {name} violated by value {value:?}")]
    UniqueConstraintViolation { name: String, value: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EventStoreError {
    /// Concurrency conflicts are retryable with a fresh write-model reload
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::OptimisticConcurrency { .. })
    }
}
