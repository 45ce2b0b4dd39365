//! Auth-request write model
//!
//! An in-progress interactive authorization. Every step of the flow is an
//! event; the model decides which transitions are still legal and whether
//! the required factors have been satisfied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "auth_request";

pub const ADDED: &str = "auth_request.added";
pub const USER_SELECTED: &str = "auth_request.user.selected";
pub const PASSWORD_CHECKED: &str = "auth_request.password.checked";
pub const PASSWORD_CHECK_FAILED: &str = "auth_request.password.check_failed";
pub const TOTP_CHECKED: &str = "auth_request.totp.checked";
pub const TOTP_CHECK_FAILED: &str = "auth_request.totp.check_failed";
pub const SUCCEEDED: &str = "auth_request.succeeded";
pub const CODE_EXCHANGED: &str = "auth_request.code.exchanged";
pub const FAILED: &str = "auth_request.failed";

/// PKCE code challenge transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "S256")]
    S256,
}

/// Reasons a flow can be failed by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidRequest,
    AccessDenied,
    ConsentRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequestState {
    #[default]
    Unspecified,
    Initial,
    UserSelected,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestAddedPayload {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: Vec<String>,
    pub response_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge_method: Option<CodeChallengeMethod>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSelectedPayload {
    pub user_id: String,
    pub org_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorCheckedPayload {
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SucceededPayload {
    /// sha256 hex of the authorization code secret
    pub code_hash: String,
    pub code_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPayload {
    pub reason: FailureReason,
}

/// Auth-request write model
#[derive(Debug, Clone, Default)]
pub struct AuthRequestWriteModel {
    pub id: String,
    pub version: i64,
    pub state: AuthRequestState,
    pub resource_owner: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub response_type: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub state_param: Option<String>,
    pub org_id: Option<String>,
    pub selected_user_id: Option<String>,
    pub selected_org_id: Option<String>,
    pub password_checked_at: Option<DateTime<Utc>>,
    pub totp_checked_at: Option<DateTime<Utc>>,
    pub failed_factor_attempts: u32,
    pub code_hash: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub code_exchanged: bool,
    pub failure_reason: Option<FailureReason>,
}

impl AuthRequestWriteModel {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            AuthRequestState::Succeeded | AuthRequestState::Failed
        )
    }

    /// All factors the given policy demands have been checked successfully
    pub fn factors_satisfied(&self, require_mfa: bool) -> bool {
        self.password_checked_at.is_some() && (!require_mfa || self.totp_checked_at.is_some())
    }
}

impl WriteModel for AuthRequestWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            ADDED => {
                if let Ok(payload) = event.decode::<AuthRequestAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.resource_owner = event.owner.clone();
                    self.client_id = payload.client_id;
                    self.redirect_uri = payload.redirect_uri;
                    self.scope = payload.scope;
                    self.response_type = payload.response_type;
                    self.code_challenge = payload.code_challenge;
                    self.code_challenge_method = payload.code_challenge_method;
                    self.state_param = payload.state;
                    self.org_id = payload.org_id;
                    self.state = AuthRequestState::Initial;
                }
            }
            USER_SELECTED => {
                if let Ok(payload) = event.decode::<UserSelectedPayload>() {
                    self.selected_user_id = Some(payload.user_id);
                    self.selected_org_id = Some(payload.org_id);
                    self.state = AuthRequestState::UserSelected;
                }
            }
            PASSWORD_CHECKED => {
                if let Ok(payload) = event.decode::<FactorCheckedPayload>() {
                    self.password_checked_at = Some(payload.checked_at);
                }
            }
            TOTP_CHECKED => {
                if let Ok(payload) = event.decode::<FactorCheckedPayload>() {
                    self.totp_checked_at = Some(payload.checked_at);
                }
            }
            PASSWORD_CHECK_FAILED | TOTP_CHECK_FAILED => {
                self.failed_factor_attempts += 1;
            }
            SUCCEEDED => {
                if let Ok(payload) = event.decode::<SucceededPayload>() {
                    self.code_hash = Some(payload.code_hash);
                    self.code_expires_at = Some(payload.code_expires_at);
                    self.state = AuthRequestState::Succeeded;
                }
            }
            CODE_EXCHANGED => self.code_exchanged = true,
            FAILED => {
                if let Ok(payload) = event.decode::<FailedPayload>() {
                    self.failure_reason = Some(payload.reason);
                    self.state = AuthRequestState::Failed;
                }
            }
            _ => {}
        }
    }
}
