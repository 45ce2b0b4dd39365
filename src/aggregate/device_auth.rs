//! Device-authorization write model
//!
//! RFC 8628 grant state. The device code is the aggregate id; expiry is
//! computed against the wall clock at decision time, not stored as state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "device_auth";

pub const ADDED: &str = "device_auth.added";
pub const POLLED: &str = "device_auth.polled";
pub const APPROVED: &str = "device_auth.approved";
pub const DENIED: &str = "device_auth.denied";
pub const CANCELLED: &str = "device_auth.cancelled";
pub const EXPIRED: &str = "device_auth.expired";
pub const COMPLETED: &str = "device_auth.completed";

/// Name of the per-instance user-code unique constraint
pub const USER_CODE_CONSTRAINT: &str = "device_auth.user_code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAuthState {
    #[default]
    Unspecified,
    Pending,
    Approved,
    Denied,
    Cancelled,
    Expired,
    /// Approved and redeemed at the token endpoint; the device code is spent
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthAddedPayload {
    pub client_id: String,
    #[serde(default)]
    pub scope: Vec<String>,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_at: DateTime<Utc>,
    pub interval_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolledPayload {
    pub polled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPayload {
    pub user_id: String,
    pub decided_at: DateTime<Utc>,
}

/// Device-authorization write model
#[derive(Debug, Clone, Default)]
pub struct DeviceAuthWriteModel {
    /// Device code
    pub id: String,
    pub version: i64,
    pub state: DeviceAuthState,
    pub resource_owner: String,
    pub client_id: String,
    pub scope: Vec<String>,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub interval_secs: i64,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub approved_user_id: Option<String>,
}

impl DeviceAuthWriteModel {
    /// State as visible at `now`: a pending grant past its expiry reads as
    /// expired even before the `device_auth.expired` event is written.
    pub fn state_at(&self, now: DateTime<Utc>) -> DeviceAuthState {
        match (self.state, self.expires_at) {
            (DeviceAuthState::Pending, Some(expires_at)) if now >= expires_at => {
                DeviceAuthState::Expired
            }
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            DeviceAuthState::Approved
                | DeviceAuthState::Denied
                | DeviceAuthState::Cancelled
                | DeviceAuthState::Expired
                | DeviceAuthState::Completed
        )
    }

    /// Whether a poll at `now` arrives within the minimum interval
    pub fn polling_too_fast(&self, now: DateTime<Utc>) -> bool {
        match self.last_polled_at {
            Some(last) => now < last + chrono::Duration::seconds(self.interval_secs),
            None => false,
        }
    }
}

impl WriteModel for DeviceAuthWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            ADDED => {
                if let Ok(payload) = event.decode::<DeviceAuthAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.resource_owner = event.owner.clone();
                    self.client_id = payload.client_id;
                    self.scope = payload.scope;
                    self.user_code = payload.user_code;
                    self.verification_uri = payload.verification_uri;
                    self.verification_uri_complete = payload.verification_uri_complete;
                    self.expires_at = Some(payload.expires_at);
                    self.interval_secs = payload.interval_secs;
                    self.state = DeviceAuthState::Pending;
                }
            }
            POLLED => {
                if let Ok(payload) = event.decode::<PolledPayload>() {
                    self.last_polled_at = Some(payload.polled_at);
                }
            }
            APPROVED => {
                if let Ok(payload) = event.decode::<DecisionPayload>() {
                    self.approved_user_id = Some(payload.user_id);
                    self.state = DeviceAuthState::Approved;
                }
            }
            DENIED => self.state = DeviceAuthState::Denied,
            CANCELLED => self.state = DeviceAuthState::Cancelled,
            EXPIRED => self.state = DeviceAuthState::Expired,
            COMPLETED => self.state = DeviceAuthState::Completed,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventPosition;
    use chrono::Duration;
    use serde_json::json;

    fn stored(version: i64, event_type: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            instance_id: "inst-1".to_string(),
            aggregate_type: AGGREGATE_TYPE.to_string(),
            aggregate_id: "device-code-1".to_string(),
            aggregate_version: version,
            event_type: event_type.to_string(),
            payload,
            creator: "system".to_string(),
            owner: "inst-1".to_string(),
            position: EventPosition::new(version, 0),
            created_at: Utc::now(),
            revision: 1,
        }
    }

    fn added(expires_at: DateTime<Utc>) -> StoredEvent {
        stored(
            1,
            ADDED,
            json!({
                "client_id": "tv",
                "scope": ["openid"],
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://ex.com/device",
                "verification_uri_complete": "https://ex.com/device?user_code=ABCD-EFGH",
                "expires_at": expires_at,
                "interval_secs": 5
            }),
        )
    }

    #[test]
    fn test_pending_reads_expired_past_deadline() {
        let now = Utc::now();
        let model = DeviceAuthWriteModel::fold(&[added(now - Duration::seconds(1))]);
        assert_eq!(model.state, DeviceAuthState::Pending);
        assert_eq!(model.state_at(now), DeviceAuthState::Expired);
    }

    #[test]
    fn test_approval_fold() {
        let now = Utc::now();
        let events = vec![
            added(now + Duration::seconds(600)),
            stored(2, APPROVED, json!({"user_id": "u1", "decided_at": now})),
        ];
        let model = DeviceAuthWriteModel::fold(&events);
        assert_eq!(model.state_at(now), DeviceAuthState::Approved);
        assert_eq!(model.approved_user_id.as_deref(), Some("u1"));
        assert!(model.is_terminal());
    }

    #[test]
    fn test_polling_interval() {
        let now = Utc::now();
        let events = vec![
            added(now + Duration::seconds(600)),
            stored(2, POLLED, json!({"polled_at": now})),
        ];
        let model = DeviceAuthWriteModel::fold(&events);
        assert!(model.polling_too_fast(now + Duration::seconds(2)));
        assert!(!model.polling_too_fast(now + Duration::seconds(6)));
    }

    #[test]
    fn test_approved_does_not_expire() {
        let now = Utc::now();
        let events = vec![
            added(now + Duration::seconds(1)),
            stored(2, APPROVED, json!({"user_id": "u1", "decided_at": now})),
        ];
        let model = DeviceAuthWriteModel::fold(&events);
        assert_eq!(
            model.state_at(now + Duration::seconds(700)),
            DeviceAuthState::Approved
        );
    }
}
