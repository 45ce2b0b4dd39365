//! In-memory event store
//!
//! Same contract as the PostgreSQL backend over process-local state.
//! Used by the test suite and by embedded deployments without a database.
//! The single write lock serializes commits, so per-instance positions are
//! assigned and become visible strictly in order.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    EventFilter, EventPosition, EventStore, EventStoreError, Push, StoredEvent,
    UniqueConstraintOp,
};

#[derive(Default)]
struct MemoryState {
    /// All events in commit order
    events: Vec<StoredEvent>,
    /// Latest version per (instance, aggregate_type, aggregate_id)
    versions: HashMap<(String, String, String), i64>,
    /// Held unique constraints: (instance, name, value)
    constraints: HashSet<(String, String, String)>,
    /// Next commit position per instance
    next_position: HashMap<String, i64>,
}

/// In-memory `EventStore` implementation
#[derive(Default)]
pub struct MemoryEventStore {
    state: RwLock<MemoryState>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn push(&self, push: Push) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut state = self.state.write().await;

        // Version check per aggregate: intended versions must continue the
        // stored head contiguously.
        let mut heads: HashMap<(String, String), i64> = HashMap::new();
        for event in &push.events {
            let key = (event.aggregate_type.clone(), event.aggregate_id.clone());
            let head = *heads.entry(key.clone()).or_insert_with(|| {
                state
                    .versions
                    .get(&(
                        push.instance_id.clone(),
                        event.aggregate_type.clone(),
                        event.aggregate_id.clone(),
                    ))
                    .copied()
                    .unwrap_or(0)
            });
            if event.aggregate_version != head + 1 {
                return Err(EventStoreError::OptimisticConcurrency {
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_id: event.aggregate_id.clone(),
                    expected: event.aggregate_version,
                    actual: head,
                });
            }
            heads.insert(key, event.aggregate_version);
        }

        // Constraint changes; a duplicate add aborts the whole push.
        let mut added: Vec<(String, String, String)> = Vec::new();
        let mut removed: Vec<(String, String, String)> = Vec::new();
        for op in &push.constraints {
            match op {
                UniqueConstraintOp::Add { name, value } => {
                    let key = (push.instance_id.clone(), name.clone(), value.clone());
                    if state.constraints.contains(&key) {
                        // Roll back constraint changes staged in this push
                        for key in added {
                            state.constraints.remove(&key);
                        }
                        for key in removed {
                            state.constraints.insert(key);
                        }
                        return Err(EventStoreError::UniqueConstraintViolation {
                            name: name.clone(),
                            value: value.clone(),
                        });
                    }
                    state.constraints.insert(key.clone());
                    added.push(key);
                }
                UniqueConstraintOp::Remove { name, value } => {
                    let key = (push.instance_id.clone(), name.clone(), value.clone());
                    if state.constraints.remove(&key) {
                        removed.push(key);
                    }
                }
            }
        }

        // Assign one commit position to the batch and append.
        let position = {
            let next = state
                .next_position
                .entry(push.instance_id.clone())
                .or_insert(1);
            let position = *next;
            *next += 1;
            position
        };

        let created_at = Utc::now();
        let mut stored = Vec::with_capacity(push.events.len());
        for (idx, event) in push.events.into_iter().enumerate() {
            state.versions.insert(
                (
                    push.instance_id.clone(),
                    event.aggregate_type.clone(),
                    event.aggregate_id.clone(),
                ),
                event.aggregate_version,
            );
            let stored_event = StoredEvent {
                instance_id: push.instance_id.clone(),
                aggregate_type: event.aggregate_type,
                aggregate_id: event.aggregate_id,
                aggregate_version: event.aggregate_version,
                event_type: event.event_type,
                payload: event.payload,
                creator: event.creator,
                owner: event.owner,
                position: EventPosition::new(position, idx as i64),
                created_at,
                revision: event.revision,
            };
            state.events.push(stored_event.clone());
            stored.push(stored_event);
        }

        Ok(stored)
    }

    async fn filter(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.state.read().await;
        let mut matched: Vec<StoredEvent> = state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }

    async fn latest_version(
        &self,
        instance_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .get(&(
                instance_id.to_string(),
                aggregate_type.to_string(),
                aggregate_id.to_string(),
            ))
            .copied()
            .unwrap_or(0))
    }

    async fn max_position(
        &self,
        instance_id: &str,
    ) -> Result<Option<EventPosition>, EventStoreError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .rev()
            .find(|e| e.instance_id == instance_id)
            .map(|e| e.position))
    }

    async fn instances(&self) -> Result<Vec<String>, EventStoreError> {
        let state = self.state.read().await;
        let mut instances: Vec<String> = state.next_position.keys().cloned().collect();
        instances.sort();
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::PendingEvent;
    use serde_json::json;

    fn pending(aggregate_id: &str, version: i64, event_type: &str) -> PendingEvent {
        PendingEvent {
            aggregate_type: "user".to_string(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_version: version,
            event_type: event_type.to_string(),
            payload: json!({}),
            creator: "system".to_string(),
            owner: "org-1".to_string(),
            revision: 1,
        }
    }

    #[tokio::test]
    async fn test_push_assigns_increasing_positions() {
        let store = MemoryEventStore::new();

        let first = store
            .push(Push::new("inst-1", vec![pending("u1", 1, "user.human.added")]))
            .await
            .unwrap();
        let second = store
            .push(Push::new(
                "inst-1",
                vec![
                    pending("u2", 1, "user.human.added"),
                    pending("u2", 2, "user.deactivated"),
                ],
            ))
            .await
            .unwrap();

        assert!(first[0].position < second[0].position);
        assert!(second[0].position < second[1].position);
        assert_eq!(second[0].position.position, second[1].position.position);
        assert_eq!(second[1].position.in_tx_order, 1);
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let store = MemoryEventStore::new();
        store
            .push(Push::new("inst-1", vec![pending("u1", 1, "user.human.added")]))
            .await
            .unwrap();

        // A second writer that also expects to write version 1 loses.
        let err = store
            .push(Push::new("inst-1", vec![pending("u1", 1, "user.deactivated")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::OptimisticConcurrency {
                expected: 1,
                actual: 1,
                ..
            }
        ));

        assert_eq!(store.latest_version("inst-1", "user", "u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_contiguous_batch_rejected() {
        let store = MemoryEventStore::new();
        let err = store
            .push(Push::new(
                "inst-1",
                vec![
                    pending("u1", 1, "user.human.added"),
                    pending("u1", 3, "user.deactivated"),
                ],
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::OptimisticConcurrency { expected: 3, .. }
        ));
        // Nothing was written
        assert_eq!(store.latest_version("inst-1", "user", "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unique_constraint_scoped_to_instance() {
        let store = MemoryEventStore::new();
        let claim = |instance: &str, aggregate: &str| {
            Push::new(instance, vec![pending(aggregate, 1, "user.human.added")]).with_constraints(
                vec![UniqueConstraintOp::add("user.username", "org-1:alice")],
            )
        };

        store.push(claim("inst-1", "u1")).await.unwrap();

        let err = store.push(claim("inst-1", "u2")).await.unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::UniqueConstraintViolation { .. }
        ));
        // The failed push wrote nothing
        assert_eq!(store.latest_version("inst-1", "user", "u2").await.unwrap(), 0);

        // Same value in another instance is fine
        store.push(claim("inst-2", "u1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_constraint_release_allows_reclaim() {
        let store = MemoryEventStore::new();
        store
            .push(
                Push::new("inst-1", vec![pending("u1", 1, "user.human.added")]).with_constraints(
                    vec![UniqueConstraintOp::add("user.username", "org-1:alice")],
                ),
            )
            .await
            .unwrap();
        store
            .push(
                Push::new("inst-1", vec![pending("u1", 2, "user.removed")]).with_constraints(
                    vec![UniqueConstraintOp::remove("user.username", "org-1:alice")],
                ),
            )
            .await
            .unwrap();
        store
            .push(
                Push::new("inst-1", vec![pending("u2", 1, "user.human.added")]).with_constraints(
                    vec![UniqueConstraintOp::add("user.username", "org-1:alice")],
                ),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_filter_position_cursor() {
        let store = MemoryEventStore::new();
        store
            .push(Push::new("inst-1", vec![pending("u1", 1, "user.human.added")]))
            .await
            .unwrap();
        let second = store
            .push(Push::new("inst-1", vec![pending("u1", 2, "user.deactivated")]))
            .await
            .unwrap();

        let all = store
            .filter(&EventFilter::instance("inst-1"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let after_first = store
            .filter(&EventFilter::instance("inst-1").after_position(all[0].position))
            .await
            .unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].position, second[0].position);
    }

    #[tokio::test]
    async fn test_instances_and_max_position() {
        let store = MemoryEventStore::new();
        assert!(store.instances().await.unwrap().is_empty());
        assert!(store.max_position("inst-1").await.unwrap().is_none());

        store
            .push(Push::new("inst-1", vec![pending("u1", 1, "user.human.added")]))
            .await
            .unwrap();
        store
            .push(Push::new("inst-2", vec![pending("u1", 1, "user.human.added")]))
            .await
            .unwrap();

        assert_eq!(store.instances().await.unwrap(), vec!["inst-1", "inst-2"]);
        assert!(store.max_position("inst-1").await.unwrap().is_some());
    }
}
