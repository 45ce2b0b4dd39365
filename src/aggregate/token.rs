//! Token write model
//!
//! Access and refresh tokens are aggregates of their own; introspection and
//! revocation decide against this fold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "oauth_token";

pub const ADDED: &str = "oauth_token.added";
pub const REVOKED: &str = "oauth_token.revoked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAddedPayload {
    pub token_type: TokenType,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub audience: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// sha256 hex of the opaque token secret
    pub token_hash: String,
    /// RFC 7638 thumbprint of the bound DPoP key
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dpop_jkt: Option<String>,
    /// The refresh token this access token was minted from
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refreshed_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRevokedPayload {
    pub revoked_by: String,
    pub revoked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenWriteModel {
    pub id: String,
    pub version: i64,
    pub resource_owner: String,
    pub token_type: Option<TokenType>,
    pub client_id: String,
    pub user_id: Option<String>,
    pub scope: Vec<String>,
    pub audience: Vec<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_hash: Option<String>,
    pub dpop_jkt: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
}

impl TokenWriteModel {
    /// RFC 7662 active: added, not revoked, not expired
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.exists()
            && self.revoked_at.is_none()
            && self.expires_at.map(|exp| now < exp).unwrap_or(false)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

impl WriteModel for TokenWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            ADDED => {
                if let Ok(payload) = event.decode::<TokenAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.resource_owner = event.owner.clone();
                    self.token_type = Some(payload.token_type);
                    self.client_id = payload.client_id;
                    self.user_id = payload.user_id;
                    self.scope = payload.scope;
                    self.audience = payload.audience;
                    self.issued_at = Some(payload.issued_at);
                    self.expires_at = Some(payload.expires_at);
                    self.token_hash = Some(payload.token_hash);
                    self.dpop_jkt = payload.dpop_jkt;
                }
            }
            REVOKED => {
                if let Ok(payload) = event.decode::<TokenRevokedPayload>() {
                    self.revoked_at = Some(payload.revoked_at);
                    self.revoked_by = Some(payload.revoked_by);
                }
            }
            _ => {}
        }
    }
}
