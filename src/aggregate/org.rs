//! Organization write model
//!
//! Holds the org's domains (one may be primary), members and login policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "org";

pub const ADDED: &str = "org.added";
pub const CHANGED: &str = "org.changed";
pub const DOMAIN_ADDED: &str = "org.domain.added";
pub const DOMAIN_PRIMARY_SET: &str = "org.domain.primary.set";
pub const DOMAIN_REMOVED: &str = "org.domain.removed";
pub const MEMBER_ADDED: &str = "org.member.added";
pub const MEMBER_CHANGED: &str = "org.member.changed";
pub const MEMBER_REMOVED: &str = "org.member.removed";
pub const LOGIN_POLICY_CHANGED: &str = "org.policy.login.changed";

/// Name of the per-org domain unique constraint
pub const DOMAIN_CONSTRAINT: &str = "org.domain";

pub fn domain_constraint_value(org_id: &str, domain: &str) -> String {
    format!("{org_id}:{domain}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgState {
    #[default]
    Unspecified,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgAddedPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgChangedPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainPayload {
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPayload {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRemovedPayload {
    pub user_id: String,
}

/// Login requirements applied to auth requests of this org
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoginPolicy {
    /// Whether a second factor is required before an auth request may succeed
    #[serde(default)]
    pub require_mfa: bool,
}

#[derive(Debug, Clone)]
pub struct OrgDomain {
    pub domain: String,
    pub is_primary: bool,
}

/// Organization write model
#[derive(Debug, Clone, Default)]
pub struct OrgWriteModel {
    pub id: String,
    pub version: i64,
    pub state: OrgState,
    pub name: String,
    pub domains: Vec<OrgDomain>,
    /// member user id -> roles
    pub members: HashMap<String, Vec<String>>,
    /// Org-level login policy; `None` means instance defaults apply
    pub login_policy: Option<LoginPolicy>,
}

impl OrgWriteModel {
    pub fn domain(&self, domain: &str) -> Option<&OrgDomain> {
        self.domains.iter().find(|d| d.domain == domain)
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }
}

impl WriteModel for OrgWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            ADDED => {
                if let Ok(payload) = event.decode::<OrgAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.name = payload.name;
                    self.state = OrgState::Active;
                }
            }
            CHANGED => {
                if let Ok(payload) = event.decode::<OrgChangedPayload>() {
                    self.name = payload.name;
                }
            }
            DOMAIN_ADDED => {
                if let Ok(payload) = event.decode::<DomainPayload>() {
                    self.domains.push(OrgDomain {
                        domain: payload.domain,
                        is_primary: false,
                    });
                }
            }
            DOMAIN_PRIMARY_SET => {
                if let Ok(payload) = event.decode::<DomainPayload>() {
                    for domain in &mut self.domains {
                        domain.is_primary = domain.domain == payload.domain;
                    }
                }
            }
            DOMAIN_REMOVED => {
                if let Ok(payload) = event.decode::<DomainPayload>() {
                    self.domains.retain(|d| d.domain != payload.domain);
                }
            }
            MEMBER_ADDED | MEMBER_CHANGED => {
                if let Ok(payload) = event.decode::<MemberPayload>() {
                    self.members.insert(payload.user_id, payload.roles);
                }
            }
            MEMBER_REMOVED => {
                if let Ok(payload) = event.decode::<MemberRemovedPayload>() {
                    self.members.remove(&payload.user_id);
                }
            }
            LOGIN_POLICY_CHANGED => {
                if let Ok(policy) = event.decode::<LoginPolicy>() {
                    self.login_policy = Some(policy);
                }
            }
            _ => {}
        }
    }
}
