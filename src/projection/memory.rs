//! In-memory checkpoints and read model
//!
//! Back the projection runtime in tests and embedded deployments, with the
//! same contracts as the PostgreSQL implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::aggregate::user;
use crate::event_store::{EventPosition, StoredEvent};

use super::{decode, Checkpoint, CheckpointStatus, Checkpoints, Projection, ProjectionError};

/// In-memory `Checkpoints` implementation
#[derive(Default)]
pub struct MemoryCheckpoints {
    state: RwLock<HashMap<(String, String), Checkpoint>>,
    parked: RwLock<Vec<(String, StoredEvent, String)>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parked events, for assertions
    pub async fn parked(&self) -> Vec<(String, StoredEvent, String)> {
        self.parked.read().await.clone()
    }
}

#[async_trait]
impl Checkpoints for MemoryCheckpoints {
    async fn init(&self) -> Result<(), ProjectionError> {
        Ok(())
    }

    async fn get(
        &self,
        projection: &str,
        instance_id: &str,
    ) -> Result<EventPosition, ProjectionError> {
        Ok(self
            .state
            .read()
            .await
            .get(&(projection.to_string(), instance_id.to_string()))
            .map(|c| c.position)
            .unwrap_or_else(EventPosition::zero))
    }

    async fn advance(
        &self,
        projection: &str,
        event: &StoredEvent,
        status: CheckpointStatus,
    ) -> Result<(), ProjectionError> {
        let mut state = self.state.write().await;
        let key = (projection.to_string(), event.instance_id.clone());
        let entry = state.entry(key).or_insert_with(|| Checkpoint {
            projection: projection.to_string(),
            instance_id: event.instance_id.clone(),
            position: EventPosition::zero(),
            event_timestamp: None,
            last_run_at: None,
            status: CheckpointStatus::Running,
        });
        if event.position > entry.position {
            entry.position = event.position;
            entry.event_timestamp = Some(event.created_at);
        }
        entry.last_run_at = Some(Utc::now());
        entry.status = status;
        Ok(())
    }

    async fn park_failed(
        &self,
        projection: &str,
        event: &StoredEvent,
        error: &str,
        _attempts: u32,
    ) -> Result<(), ProjectionError> {
        self.parked
            .write()
            .await
            .push((projection.to_string(), event.clone(), error.to_string()));
        Ok(())
    }

    async fn reset(&self, projection: &str, instance_id: &str) -> Result<(), ProjectionError> {
        self.state
            .write()
            .await
            .remove(&(projection.to_string(), instance_id.to_string()));
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Checkpoint>, ProjectionError> {
        Ok(self.state.read().await.values().cloned().collect())
    }
}

/// One row of the in-memory users read model
#[derive(Debug, Clone)]
pub struct UserRow {
    pub instance_id: String,
    pub id: String,
    pub resource_owner: String,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub state: user::UserState,
    pub sequence: i64,
    pub updated_at: DateTime<Utc>,
}

/// In-memory users projection, reducer-compatible with the PostgreSQL one
#[derive(Default)]
pub struct MemoryUsersProjection {
    rows: RwLock<HashMap<(String, String), UserRow>>,
}

impl MemoryUsersProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, instance_id: &str, user_id: &str) -> Option<UserRow> {
        self.rows
            .read()
            .await
            .get(&(instance_id.to_string(), user_id.to_string()))
            .cloned()
    }

    pub async fn rows(&self, instance_id: &str) -> Vec<UserRow> {
        let mut rows: Vec<UserRow> = self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

#[async_trait]
impl Projection for MemoryUsersProjection {
    fn name(&self) -> &'static str {
        "users"
    }

    async fn init(&self) -> Result<(), ProjectionError> {
        Ok(())
    }

    async fn reduce(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.aggregate_type != user::AGGREGATE_TYPE {
            return Ok(());
        }
        let mut rows = self.rows.write().await;
        let key = (event.instance_id.clone(), event.aggregate_id.clone());

        // Skip re-delivered events the row has already seen
        if let Some(row) = rows.get(&key) {
            if row.sequence >= event.aggregate_version {
                return Ok(());
            }
        }

        match event.event_type.as_str() {
            user::HUMAN_ADDED => {
                let payload: user::HumanAddedPayload = decode(event)?;
                rows.insert(
                    key,
                    UserRow {
                        instance_id: event.instance_id.clone(),
                        id: event.aggregate_id.clone(),
                        resource_owner: event.owner.clone(),
                        username: payload.username,
                        email: payload.email,
                        display_name: payload.display_name,
                        state: user::UserState::Active,
                        sequence: event.aggregate_version,
                        updated_at: event.created_at,
                    },
                );
            }
            user::PROFILE_CHANGED => {
                if let Some(row) = rows.get_mut(&key) {
                    let payload: user::ProfileChangedPayload = decode(event)?;
                    if let Some(email) = payload.email {
                        row.email = email;
                    }
                    if let Some(display_name) = payload.display_name {
                        row.display_name = Some(display_name);
                    }
                    row.sequence = event.aggregate_version;
                    row.updated_at = event.created_at;
                }
            }
            user::USERNAME_CHANGED => {
                if let Some(row) = rows.get_mut(&key) {
                    let payload: user::UsernameChangedPayload = decode(event)?;
                    row.username = payload.username;
                    row.sequence = event.aggregate_version;
                    row.updated_at = event.created_at;
                }
            }
            user::DEACTIVATED | user::REACTIVATED | user::REMOVED => {
                if let Some(row) = rows.get_mut(&key) {
                    row.state = match event.event_type.as_str() {
                        user::DEACTIVATED => user::UserState::Inactive,
                        user::REACTIVATED => user::UserState::Active,
                        _ => user::UserState::Removed,
                    };
                    row.sequence = event.aggregate_version;
                    row.updated_at = event.created_at;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, instance_id: &str) -> Result<(), ProjectionError> {
        self.rows
            .write()
            .await
            .retain(|(instance, _), _| instance.as_str() != instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(version: i64, event_type: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            instance_id: "inst-1".to_string(),
            aggregate_type: "user".to_string(),
            aggregate_id: "u1".to_string(),
            aggregate_version: version,
            event_type: event_type.to_string(),
            payload,
            creator: "system".to_string(),
            owner: "org-1".to_string(),
            position: EventPosition::new(version, 0),
            created_at: Utc::now(),
            revision: 1,
        }
    }

    #[tokio::test]
    async fn test_reduce_is_idempotent() {
        let projection = MemoryUsersProjection::new();
        let added = stored(
            1,
            user::HUMAN_ADDED,
            json!({"username": "alice", "email": "a@ex.com"}),
        );
        let renamed = stored(2, user::USERNAME_CHANGED, json!({"username": "alice2"}));

        projection.reduce(&added).await.unwrap();
        projection.reduce(&renamed).await.unwrap();
        // Re-delivery of both events changes nothing
        projection.reduce(&added).await.unwrap();
        projection.reduce(&renamed).await.unwrap();

        let row = projection.get("inst-1", "u1").await.unwrap();
        assert_eq!(row.username, "alice2");
        assert_eq!(row.sequence, 2);
    }

    #[tokio::test]
    async fn test_removal_tolerates_missing_row() {
        let projection = MemoryUsersProjection::new();
        projection
            .reduce(&stored(5, user::REMOVED, json!({})))
            .await
            .unwrap();
        assert!(projection.get("inst-1", "u1").await.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_monotonic() {
        let checkpoints = MemoryCheckpoints::new();
        let first = stored(1, user::HUMAN_ADDED, json!({"username": "a", "email": "a@x"}));
        let second = stored(2, user::DEACTIVATED, json!({}));

        checkpoints
            .advance("users", &second, CheckpointStatus::Running)
            .await
            .unwrap();
        checkpoints
            .advance("users", &first, CheckpointStatus::Running)
            .await
            .unwrap();

        let cursor = checkpoints.get("users", "inst-1").await.unwrap();
        assert_eq!(cursor, second.position);
    }
}
