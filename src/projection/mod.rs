//! Projections
//!
//! Long-running consumers that reduce the event log into denormalized read
//! tables. Each projection owns its tables and its checkpoint rows; reducers
//! are idempotent (sequence-guarded upserts), so re-delivery after a crash
//! or restart is harmless.

mod applications;
mod auth_requests;
mod checkpoints;
mod device_auths;
mod idps;
mod memory;
mod orgs;
mod projects;
mod runtime;
mod tokens;
mod users;

pub use applications::ApplicationsProjection;
pub use auth_requests::AuthRequestsProjection;
pub use checkpoints::PgCheckpoints;
pub use device_auths::DeviceAuthsProjection;
pub use idps::IdpsProjection;
pub use memory::{MemoryCheckpoints, MemoryUsersProjection, UserRow};
pub use orgs::OrgsProjection;
pub use projects::ProjectsProjection;
pub use runtime::{Projector, ProjectorConfig, ProjectionHealth};
pub use tokens::TokensProjection;
pub use users::UsersProjection;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event_store::{EventPosition, StoredEvent};

/// Projection errors
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("reducer error: {0}")]
    Reducer(String),
}

/// One checkpoint row: progress of a projection for one instance
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub projection: String,
    pub instance_id: String,
    pub position: EventPosition,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: CheckpointStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Running,
    Failing,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Running => "running",
            CheckpointStatus::Failing => "failing",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "failing" => CheckpointStatus::Failing,
            _ => CheckpointStatus::Running,
        }
    }
}

/// A read-model reducer
#[async_trait]
pub trait Projection: Send + Sync {
    /// Stable name, used as the checkpoint key
    fn name(&self) -> &'static str;

    /// Create tables and indexes if absent
    async fn init(&self) -> Result<(), ProjectionError>;

    /// Apply one event. Must be idempotent with respect to re-delivery of
    /// the same position; removal events tolerate missing rows.
    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError>;

    /// Administrative reset: truncate this projection's tables for an
    /// instance so the runtime replays from position zero.
    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError>;
}

/// Checkpoint storage plus the failed-event parking lot
#[async_trait]
pub trait Checkpoints: Send + Sync {
    async fn init(&self) -> Result<(), ProjectionError>;

    /// Current cursor; `EventPosition::zero()` for an unseen pair
    async fn get(
        &self,
        projection: &str,
        instance_id: &str,
    ) -> Result<EventPosition, ProjectionError>;

    /// Advance the cursor past `event`. Called only after a successful
    /// reduce (or after parking the event).
    async fn advance(
        &self,
        projection: &str,
        event: &StoredEvent,
        status: CheckpointStatus,
    ) -> Result<(), ProjectionError>;

    /// Park an event that kept failing so the log is not blocked
    async fn park_failed(
        &self,
        projection: &str,
        event: &StoredEvent,
        error: &str,
        attempts: u32,
    ) -> Result<(), ProjectionError>;

    /// Reset the cursor for a projection/instance to zero
    async fn reset(&self, projection: &str, instance_id: &str) -> Result<(), ProjectionError>;

    /// All checkpoint rows, for health reporting
    async fn all(&self) -> Result<Vec<Checkpoint>, ProjectionError>;
}

/// Decode helper for reducers; a payload that does not decode is a reducer
/// error (the runtime will retry, then park).
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    event: &StoredEvent,
) -> Result<T, ProjectionError> {
    serde_json::from_value(event.payload.clone()).map_err(|err| {
        ProjectionError::Reducer(format!(
            "cannot decode {} payload: {err}",
            event.event_type
        ))
    })
}
