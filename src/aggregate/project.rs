//! Project write model

use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "project";

pub const ADDED: &str = "project.added";
pub const CHANGED: &str = "project.changed";
pub const DEACTIVATED: &str = "project.deactivated";
pub const REACTIVATED: &str = "project.reactivated";
pub const ROLE_ADDED: &str = "project.role.added";
pub const ROLE_REMOVED: &str = "project.role.removed";

/// Name of the per-project role-key unique constraint
pub const ROLE_CONSTRAINT: &str = "project.role";

pub fn role_constraint_value(project_id: &str, key: &str) -> String {
    format!("{project_id}:{key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    #[default]
    Unspecified,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectAddedPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAddedPayload {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRemovedPayload {
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct ProjectRole {
    pub key: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectWriteModel {
    pub id: String,
    pub version: i64,
    pub state: ProjectState,
    pub resource_owner: String,
    pub name: String,
    pub roles: Vec<ProjectRole>,
}

impl ProjectWriteModel {
    pub fn is_active(&self) -> bool {
        self.state == ProjectState::Active
    }

    pub fn role(&self, key: &str) -> Option<&ProjectRole> {
        self.roles.iter().find(|r| r.key == key)
    }
}

impl WriteModel for ProjectWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            ADDED => {
                if let Ok(payload) = event.decode::<ProjectAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.resource_owner = event.owner.clone();
                    self.name = payload.name;
                    self.state = ProjectState::Active;
                }
            }
            CHANGED => {
                if let Ok(payload) = event.decode::<ProjectAddedPayload>() {
                    self.name = payload.name;
                }
            }
            DEACTIVATED => self.state = ProjectState::Inactive,
            REACTIVATED => self.state = ProjectState::Active,
            ROLE_ADDED => {
                if let Ok(payload) = event.decode::<RoleAddedPayload>() {
                    self.roles.push(ProjectRole {
                        key: payload.key,
                        display_name: payload.display_name,
                    });
                }
            }
            ROLE_REMOVED => {
                if let Ok(payload) = event.decode::<RoleRemovedPayload>() {
                    self.roles.retain(|r| r.key != payload.key);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventPosition;
    use chrono::Utc;
    use serde_json::json;

    fn stored(version: i64, event_type: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            instance_id: "inst-1".to_string(),
            aggregate_type: AGGREGATE_TYPE.to_string(),
            aggregate_id: "proj-1".to_string(),
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

    #[test]
    fn test_role_fold() {
        let events = vec![
            stored(1, ADDED, json!({"name": "crm"})),
            stored(2, ROLE_ADDED, json!({"key": "admin", "display_name": "Admin"})),
            stored(3, ROLE_ADDED, json!({"key": "viewer"})),
            stored(4, ROLE_REMOVED, json!({"key": "viewer"})),
        ];

        let model = ProjectWriteModel::fold(&events);
        assert!(model.is_active());
        assert_eq!(model.roles.len(), 1);
        assert!(model.role("admin").is_some());
        assert!(model.role("viewer").is_none());
    }

    #[test]
    fn test_lifecycle_fold() {
        let events = vec![
            stored(1, ADDED, json!({"name": "crm"})),
            stored(2, DEACTIVATED, json!({})),
        ];
        let model = ProjectWriteModel::fold(&events);
        assert_eq!(model.state, ProjectState::Inactive);
    }
}
