//! Instance write model
//!
//! The tenant root. Created once by instance setup; carries the default
//! organization every unscoped command falls back to.

use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "instance";

pub const ADDED: &str = "instance.added";
pub const DEFAULT_ORG_SET: &str = "instance.default_org.set";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceAddedPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultOrgSetPayload {
    pub org_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceWriteModel {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub default_org_id: Option<String>,
}

impl WriteModel for InstanceWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            ADDED => {
                if let Ok(payload) = event.decode::<InstanceAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.name = payload.name;
                }
            }
            DEFAULT_ORG_SET => {
                if let Ok(payload) = event.decode::<DefaultOrgSetPayload>() {
                    self.default_org_id = Some(payload.org_id);
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

    #[test]
    fn test_fold() {
        let events = vec![
            StoredEvent {
                instance_id: "inst-1".to_string(),
                aggregate_type: AGGREGATE_TYPE.to_string(),
                aggregate_id: "inst-1".to_string(),
                aggregate_version: 1,
                event_type: ADDED.to_string(),
                payload: json!({"name": "acme"}),
                creator: "system".to_string(),
                owner: "inst-1".to_string(),
                position: EventPosition::new(1, 0),
                created_at: Utc::now(),
                revision: 1,
            },
            StoredEvent {
                instance_id: "inst-1".to_string(),
                aggregate_type: AGGREGATE_TYPE.to_string(),
                aggregate_id: "inst-1".to_string(),
                aggregate_version: 2,
                event_type: DEFAULT_ORG_SET.to_string(),
                payload: json!({"org_id": "org-1"}),
                creator: "system".to_string(),
                owner: "inst-1".to_string(),
                position: EventPosition::new(2, 0),
                created_at: Utc::now(),
                revision: 1,
            },
        ];

        let model = InstanceWriteModel::fold(&events);
        assert_eq!(model.name, "acme");
        assert_eq!(model.default_org_id.as_deref(), Some("org-1"));
    }
}
