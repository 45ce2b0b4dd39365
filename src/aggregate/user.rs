//! User write model
//!
//! Fold of a human user's events, used to validate the next user command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "user";

// Event types
pub const HUMAN_ADDED: &str = "user.human.added";
pub const PROFILE_CHANGED: &str = "user.profile.changed";
pub const USERNAME_CHANGED: &str = "user.username.changed";
pub const DEACTIVATED: &str = "user.deactivated";
pub const REACTIVATED: &str = "user.reactivated";
pub const REMOVED: &str = "user.removed";

/// Name of the per-org username unique constraint
pub const USERNAME_CONSTRAINT: &str = "user.username";

/// Constraint value scoping a username to its organization
pub fn username_constraint_value(org_id: &str, username: &str) -> String {
    format!("{org_id}:{username}")
}

/// User lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    /// No events applied; the user does not exist
    #[default]
    Unspecified,
    Active,
    Inactive,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanAddedPayload {
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub totp_secret: Option<String>,
}

/// Changed fields only; absent fields stay untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileChangedPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
}

impl ProfileChangedPayload {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.display_name.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsernameChangedPayload {
    pub username: String,
}

/// User write model
#[derive(Debug, Clone, Default)]
pub struct UserWriteModel {
    pub id: String,
    pub version: i64,
    pub state: UserState,
    pub resource_owner: String,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub totp_secret: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl UserWriteModel {
    pub fn is_active(&self) -> bool {
        self.state == UserState::Active
    }

    pub fn is_removed(&self) -> bool {
        self.state == UserState::Removed
    }
}

impl WriteModel for UserWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            HUMAN_ADDED => {
                if let Ok(payload) = event.decode::<HumanAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.resource_owner = event.owner.clone();
                    self.username = payload.username;
                    self.email = payload.email;
                    self.first_name = payload.first_name;
                    self.last_name = payload.last_name;
                    self.display_name = payload.display_name;
                    self.password_hash = payload.password_hash;
                    self.totp_secret = payload.totp_secret;
                    self.state = UserState::Active;
                    self.created_at = Some(event.created_at);
                }
            }
            PROFILE_CHANGED => {
                if let Ok(payload) = event.decode::<ProfileChangedPayload>() {
                    if let Some(email) = payload.email {
                        self.email = email;
                    }
                    if let Some(first_name) = payload.first_name {
                        self.first_name = Some(first_name);
                    }
                    if let Some(last_name) = payload.last_name {
                        self.last_name = Some(last_name);
                    }
                    if let Some(display_name) = payload.display_name {
                        self.display_name = Some(display_name);
                    }
                }
            }
            USERNAME_CHANGED => {
                if let Ok(payload) = event.decode::<UsernameChangedPayload>() {
                    self.username = payload.username;
                }
            }
            DEACTIVATED => self.state = UserState::Inactive,
            REACTIVATED => self.state = UserState::Active,
            REMOVED => self.state = UserState::Removed,
            _ => {}
        }
    }
}
