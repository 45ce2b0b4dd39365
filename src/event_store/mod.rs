//! Event Store module
//!
//! The append-only log every state change goes through. Events are immutable,
//! totally ordered per instance, and versioned per aggregate. Two backends
//! share one trait: PostgreSQL for durable deployments and an in-memory store
//! for tests and embedded use.

mod error;
mod memory;
mod postgres;

pub use error::EventStoreError;
pub use memory::MemoryEventStore;
pub use postgres::PostgresEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Global commit order of an event within one instance.
///
/// `position` is the commit position (monotone, not necessarily gap-free);
/// `in_tx_order` orders events within one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition {
    pub position: i64,
    pub in_tx_order: i64,
}

impl EventPosition {
    pub fn new(position: i64, in_tx_order: i64) -> Self {
        Self {
            position,
            in_tx_order,
        }
    }

    /// Cursor value before the first event.
    pub fn zero() -> Self {
        Self {
            position: 0,
            in_tx_order: 0,
        }
    }
}

/// Stored event as read back from the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub instance_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub aggregate_version: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub creator: String,
    pub owner: String,
    pub position: EventPosition,
    pub created_at: DateTime<Utc>,
    pub revision: i16,
}

impl StoredEvent {
    /// Decode the payload into a typed struct. Unknown fields in the stored
    /// tree are ignored by the target type and survive untouched in the log.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventStoreError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Event to be appended, carrying its intended aggregate version
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub aggregate_version: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub creator: String,
    pub owner: String,
    pub revision: i16,
}

impl PendingEvent {
    pub fn new<P: Serialize>(
        aggregate_type: &str,
        aggregate_id: &str,
        aggregate_version: i64,
        event_type: &str,
        payload: &P,
        creator: &str,
        owner: &str,
    ) -> Result<Self, EventStoreError> {
        Ok(Self {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_version,
            event_type: event_type.to_string(),
            payload: serde_json::to_value(payload)?,
            creator: creator.to_string(),
            owner: owner.to_string(),
            revision: 1,
        })
    }
}

/// Unique-constraint operation applied atomically with a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniqueConstraintOp {
    /// Claim `(constraint_name, value)` for the instance; fails on duplicate
    Add { name: String, value: String },
    /// Release a previously claimed value
    Remove { name: String, value: String },
}

impl UniqueConstraintOp {
    pub fn add(name: &str, value: &str) -> Self {
        Self::Add {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn remove(name: &str, value: &str) -> Self {
        Self::Remove {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Atomic batch of events plus constraint changes for one instance
#[derive(Debug, Clone)]
pub struct Push {
    pub instance_id: String,
    pub events: Vec<PendingEvent>,
    pub constraints: Vec<UniqueConstraintOp>,
}

impl Push {
    pub fn new(instance_id: &str, events: Vec<PendingEvent>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            events,
            constraints: Vec::new(),
        }
    }

    pub fn with_constraints(mut self, constraints: Vec<UniqueConstraintOp>) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Query over the event log; empty vectors mean "no restriction"
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub instance_id: String,
    pub aggregate_types: Vec<String>,
    pub aggregate_ids: Vec<String>,
    pub event_types: Vec<String>,
    pub owners: Vec<String>,
    pub position_after: Option<EventPosition>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl EventFilter {
    pub fn instance(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ..Default::default()
        }
    }

    /// All events of one aggregate, in version order
    pub fn aggregate(instance_id: &str, aggregate_type: &str, aggregate_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            aggregate_types: vec![aggregate_type.to_string()],
            aggregate_ids: vec![aggregate_id.to_string()],
            ..Default::default()
        }
    }

    pub fn with_aggregate_types(mut self, types: &[&str]) -> Self {
        self.aggregate_types = types.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_event_types(mut self, types: &[&str]) -> Self {
        self.event_types = types.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_owners(mut self, owners: &[&str]) -> Self {
        self.owners = owners.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn after_position(mut self, position: EventPosition) -> Self {
        self.position_after = Some(position);
        self
    }

    pub fn created_after(mut self, after: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a stored event matches this filter (position/limit aside,
    /// which are applied by the store).
    pub(crate) fn matches(&self, event: &StoredEvent) -> bool {
        if event.instance_id != self.instance_id {
            return false;
        }
        if !self.aggregate_types.is_empty() && !self.aggregate_types.contains(&event.aggregate_type)
        {
            return false;
        }
        if !self.aggregate_ids.is_empty() && !self.aggregate_ids.contains(&event.aggregate_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.owners.is_empty() && !self.owners.contains(&event.owner) {
            return false;
        }
        if let Some(after) = self.position_after {
            if event.position <= after {
                return false;
            }
        }
        if let Some(created_after) = self.created_after {
            if event.created_at < created_after {
                return false;
            }
        }
        true
    }
}

/// The append-only log shared by commands and projections.
///
/// Guarantees: per-aggregate versions are contiguous from 1; per-instance
/// positions are strictly increasing; a reader that has processed up to
/// position `p` never later observes an event below `p`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch atomically. Every event must carry the version it
    /// expects to occupy; a mismatch with the stored head aborts the whole
    /// push with `OptimisticConcurrency`. Constraint collisions abort with
    /// `UniqueConstraintViolation`. Returns the stored events with their
    /// assigned positions and commit timestamps.
    async fn push(&self, push: Push) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Events matching the filter, in per-instance position order.
    async fn filter(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Highest version stored for an aggregate, 0 if the aggregate is new.
    async fn latest_version(
        &self,
        instance_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError>;

    /// Highest committed position of an instance, if any events exist.
    async fn max_position(
        &self,
        instance_id: &str,
    ) -> Result<Option<EventPosition>, EventStoreError>;

    /// Distinct instance ids present in the log.
    async fn instances(&self) -> Result<Vec<String>, EventStoreError>;
}
