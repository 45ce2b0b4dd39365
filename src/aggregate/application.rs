//! Application write model
//!
//! An application belongs to a project and carries an OIDC client
//! configuration with its redirect URIs and hashed client secret.

use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "application";

pub const ADDED: &str = "application.added";
pub const OIDC_CONFIG_ADDED: &str = "application.oidc.config.added";
pub const OIDC_CONFIG_CHANGED: &str = "application.oidc.config.changed";
pub const REDIRECT_URI_ADDED: &str = "application.oidc.redirect_uri.added";
pub const REDIRECT_URI_REMOVED: &str = "application.oidc.redirect_uri.removed";
pub const SECRET_CHANGED: &str = "application.oidc.secret.changed";
pub const DEACTIVATED: &str = "application.deactivated";
pub const REACTIVATED: &str = "application.reactivated";
pub const REMOVED: &str = "application.removed";

/// Name of the per-instance client-id unique constraint
pub const CLIENT_ID_CONSTRAINT: &str = "application.client_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    #[default]
    Unspecified,
    Active,
    Inactive,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppAddedPayload {
    pub project_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfigAddedPayload {
    pub client_id: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    pub auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_secret_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub registration_token_hash: Option<String>,
}

/// Changed fields only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OidcConfigChangedPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub redirect_uris: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub grant_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub auth_method: Option<String>,
}

impl OidcConfigChangedPayload {
    pub fn is_empty(&self) -> bool {
        self.redirect_uris.is_none()
            && self.response_types.is_none()
            && self.grant_types.is_none()
            && self.auth_method.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectUriPayload {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretChangedPayload {
    pub client_secret_hash: String,
}

/// OIDC client configuration as folded from events
#[derive(Debug, Clone, Default)]
pub struct OidcConfigState {
    pub client_id: String,
    pub redirect_uris: Vec<String>,
    pub response_types: Vec<String>,
    pub grant_types: Vec<String>,
    pub auth_method: String,
    pub client_secret_hash: Option<String>,
    pub registration_token_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppWriteModel {
    pub id: String,
    pub version: i64,
    pub state: AppState,
    pub resource_owner: String,
    pub project_id: String,
    pub name: String,
    pub oidc: Option<OidcConfigState>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl AppWriteModel {
    pub fn is_active(&self) -> bool {
        self.state == AppState::Active
    }

    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.oidc
            .as_ref()
            .map(|c| c.redirect_uris.iter().any(|u| u == uri))
            .unwrap_or(false)
    }

    pub fn supports_grant(&self, grant_type: &str) -> bool {
        self.oidc
            .as_ref()
            .map(|c| c.grant_types.iter().any(|g| g == grant_type))
            .unwrap_or(false)
    }
}

impl WriteModel for AppWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        match event.event_type.as_str() {
            ADDED => {
                if let Ok(payload) = event.decode::<AppAddedPayload>() {
                    self.id = event.aggregate_id.clone();
                    self.resource_owner = event.owner.clone();
                    self.project_id = payload.project_id;
                    self.name = payload.name;
                    self.state = AppState::Active;
                    self.created_at = Some(event.created_at);
                }
            }
            OIDC_CONFIG_ADDED => {
                if let Ok(payload) = event.decode::<OidcConfigAddedPayload>() {
                    self.oidc = Some(OidcConfigState {
                        client_id: payload.client_id,
                        redirect_uris: payload.redirect_uris,
                        response_types: payload.response_types,
                        grant_types: payload.grant_types,
                        auth_method: payload.auth_method,
                        client_secret_hash: payload.client_secret_hash,
                        registration_token_hash: payload.registration_token_hash,
                    });
                }
            }
            OIDC_CONFIG_CHANGED => {
                if let (Ok(payload), Some(config)) =
                    (event.decode::<OidcConfigChangedPayload>(), self.oidc.as_mut())
                {
                    if let Some(uris) = payload.redirect_uris {
                        config.redirect_uris = uris;
                    }
                    if let Some(types) = payload.response_types {
                        config.response_types = types;
                    }
                    if let Some(types) = payload.grant_types {
                        config.grant_types = types;
                    }
                    if let Some(method) = payload.auth_method {
                        config.auth_method = method;
                    }
                }
            }
            REDIRECT_URI_ADDED => {
                if let (Ok(payload), Some(config)) =
                    (event.decode::<RedirectUriPayload>(), self.oidc.as_mut())
                {
                    config.redirect_uris.push(payload.uri);
                }
            }
            REDIRECT_URI_REMOVED => {
                if let (Ok(payload), Some(config)) =
                    (event.decode::<RedirectUriPayload>(), self.oidc.as_mut())
                {
                    config.redirect_uris.retain(|u| *u != payload.uri);
                }
            }
            SECRET_CHANGED => {
                if let (Ok(payload), Some(config)) =
                    (event.decode::<SecretChangedPayload>(), self.oidc.as_mut())
                {
                    config.client_secret_hash = Some(payload.client_secret_hash);
                }
            }
            DEACTIVATED => self.state = AppState::Inactive,
            REACTIVATED => self.state = AppState::Active,
            REMOVED => self.state = AppState::Removed,
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
            aggregate_id: "app-1".to_string(),
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
    fn test_redirect_uri_fold() {
        let events = vec![
            stored(1, ADDED, json!({"project_id": "proj-1", "name": "web"})),
            stored(
                2,
                OIDC_CONFIG_ADDED,
                json!({
                    "client_id": "client-1",
                    "redirect_uris": ["https://a/cb"],
                    "response_types": ["code"],
                    "grant_types": ["authorization_code"],
                    "auth_method": "client_secret_basic"
                }),
            ),
            stored(3, REDIRECT_URI_ADDED, json!({"uri": "https://a/cb2"})),
            stored(4, REDIRECT_URI_REMOVED, json!({"uri": "https://a/cb2"})),
        ];

        let model = AppWriteModel::fold(&events);
        assert!(model.has_redirect_uri("https://a/cb"));
        assert!(!model.has_redirect_uri("https://a/cb2"));
        assert!(model.supports_grant("authorization_code"));
        assert!(!model.supports_grant("client_credentials"));
    }

    #[test]
    fn test_config_change_overwrites_listed_fields_only() {
        let events = vec![
            stored(1, ADDED, json!({"project_id": "proj-1", "name": "web"})),
            stored(
                2,
                OIDC_CONFIG_ADDED,
                json!({
                    "client_id": "client-1",
                    "redirect_uris": ["https://a/cb"],
                    "response_types": ["code"],
                    "grant_types": ["authorization_code"],
                    "auth_method": "client_secret_basic"
                }),
            ),
            stored(
                3,
                OIDC_CONFIG_CHANGED,
                json!({"grant_types": ["authorization_code", "refresh_token"]}),
            ),
        ];

        let model = AppWriteModel::fold(&events);
        let config = model.oidc.unwrap();
        assert_eq!(config.grant_types.len(), 2);
        assert_eq!(config.redirect_uris, vec!["https://a/cb".to_string()]);
        assert_eq!(config.auth_method, "client_secret_basic");
    }
}
