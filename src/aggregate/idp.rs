//! Identity-provider write model
//!
//! Polymorphic over provider kind. The event type encodes the kind
//! (`idp.oidc.added`, `idp.google.added`); owner scope (instance vs. org)
//! lives in the event's `owner` field.

use serde::{Deserialize, Serialize};

use crate::event_store::StoredEvent;

use super::WriteModel;

pub const AGGREGATE_TYPE: &str = "idp";

pub const OIDC_ADDED: &str = "idp.oidc.added";
pub const OAUTH2_ADDED: &str = "idp.oauth2.added";
pub const SAML_ADDED: &str = "idp.saml.added";
pub const JWT_ADDED: &str = "idp.jwt.added";
pub const GOOGLE_ADDED: &str = "idp.google.added";
pub const AZURE_ADDED: &str = "idp.azure.added";
pub const APPLE_ADDED: &str = "idp.apple.added";
pub const GITHUB_ADDED: &str = "idp.github.added";
pub const GITLAB_ADDED: &str = "idp.gitlab.added";
pub const CHANGED: &str = "idp.changed";
pub const DEACTIVATED: &str = "idp.deactivated";
pub const REACTIVATED: &str = "idp.reactivated";
pub const REMOVED: &str = "idp.removed";

/// Event types that create an IDP, with the provider label each implies
pub const ADDED_TYPES: &[(&str, &str)] = &[
    (OIDC_ADDED, "generic"),
    (OAUTH2_ADDED, "generic"),
    (SAML_ADDED, "generic"),
    (JWT_ADDED, "generic"),
    (GOOGLE_ADDED, "google"),
    (AZURE_ADDED, "azuread"),
    (APPLE_ADDED, "apple"),
    (GITHUB_ADDED, "github"),
    (GITLAB_ADDED, "gitlab"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdpState {
    #[default]
    Unspecified,
    Active,
    Inactive,
    Removed,
}

/// Fields shared by every provider kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdpCommon {
    pub name: String,
    #[serde(default)]
    pub is_creation_allowed: bool,
    #[serde(default)]
    pub is_linking_allowed: bool,
    #[serde(default)]
    pub is_auto_creation: bool,
    #[serde(default)]
    pub is_auto_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcIdpConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2IdpConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub user_endpoint: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlIdpConfig {
    pub entity_id: String,
    pub sso_url: String,
    pub certificate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtIdpConfig {
    pub issuer: String,
    pub jwt_endpoint: String,
    pub keys_endpoint: String,
    pub header_name: String,
    /// Inline verification key; assertions cannot be verified without it
    /// (fetching the keys endpoint is transport, handled elsewhere)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public_key_pem: Option<String>,
}

/// Kind-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum IdpKind {
    #[serde(rename = "oidc")]
    Oidc(OidcIdpConfig),
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2IdpConfig),
    #[serde(rename = "saml")]
    Saml(SamlIdpConfig),
    #[serde(rename = "jwt")]
    Jwt(JwtIdpConfig),
}

impl IdpKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            IdpKind::Oidc(_) => "oidc",
            IdpKind::OAuth2(_) => "oauth2",
            IdpKind::Saml(_) => "saml",
            IdpKind::Jwt(_) => "jwt",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpAddedPayload {
    #[serde(flatten)]
    pub common: IdpCommon,
    #[serde(flatten)]
    pub kind: IdpKind,
}

/// Changed fields only; kind-specific config is replaced wholesale
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdpChangedPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_creation_allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_linking_allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_auto_creation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_auto_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config: Option<IdpKind>,
}

impl IdpChangedPayload {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.is_creation_allowed.is_none()
            && self.is_linking_allowed.is_none()
            && self.is_auto_creation.is_none()
            && self.is_auto_update.is_none()
            && self.config.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdpWriteModel {
    pub id: String,
    pub version: i64,
    pub state: IdpState,
    pub resource_owner: String,
    /// Provider label implied by the add event (`google`, `apple`, ...)
    pub provider: String,
    pub common: IdpCommon,
    pub kind: Option<IdpKind>,
}

impl IdpWriteModel {
    pub fn is_active(&self) -> bool {
        self.state == IdpState::Active
    }
}

impl WriteModel for IdpWriteModel {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) {
        self.version = event.aggregate_version;
        if let Some((_, provider)) = ADDED_TYPES
            .iter()
            .find(|(added_type, _)| *added_type == event.event_type)
        {
            if let Ok(payload) = event.decode::<IdpAddedPayload>() {
                self.id = event.aggregate_id.clone();
                self.resource_owner = event.owner.clone();
                self.provider = provider.to_string();
                self.common = payload.common;
                self.kind = Some(payload.kind);
                self.state = IdpState::Active;
            }
            return;
        }
        match event.event_type.as_str() {
            CHANGED => {
                if let Ok(payload) = event.decode::<IdpChangedPayload>() {
                    if let Some(name) = payload.name {
                        self.common.name = name;
                    }
                    if let Some(v) = payload.is_creation_allowed {
                        self.common.is_creation_allowed = v;
                    }
                    if let Some(v) = payload.is_linking_allowed {
                        self.common.is_linking_allowed = v;
                    }
                    if let Some(v) = payload.is_auto_creation {
                        self.common.is_auto_creation = v;
                    }
                    if let Some(v) = payload.is_auto_update {
                        self.common.is_auto_update = v;
                    }
                    if let Some(config) = payload.config {
                        self.kind = Some(config);
                    }
                }
            }
            DEACTIVATED => self.state = IdpState::Inactive,
            REACTIVATED => self.state = IdpState::Active,
            REMOVED => self.state = IdpState::Removed,
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
            aggregate_id: "idp-1".to_string(),
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
    fn test_oidc_added_fold() {
        let events = vec![stored(
            1,
            OIDC_ADDED,
            json!({
                "name": "corp-sso",
                "is_creation_allowed": true,
                "is_linking_allowed": true,
                "is_auto_creation": false,
                "is_auto_update": false,
                "kind": "oidc",
                "issuer": "https://issuer.example.com",
                "client_id": "cid",
                "client_secret": "secret",
                "scopes": ["openid", "email"]
            }),
        )];

        let model = IdpWriteModel::fold(&events);
        assert!(model.is_active());
        assert_eq!(model.provider, "generic");
        assert_eq!(model.common.name, "corp-sso");
        match model.kind.unwrap() {
            IdpKind::Oidc(config) => {
                assert_eq!(config.issuer, "https://issuer.example.com");
                assert_eq!(config.scopes, vec!["openid", "email"]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_google_added_sets_provider() {
        let events = vec![stored(
            1,
            GOOGLE_ADDED,
            json!({
                "name": "google",
                "kind": "oidc",
                "issuer": "https://accounts.google.com",
                "client_id": "cid",
                "client_secret": "secret",
                "scopes": ["openid", "profile", "email"]
            }),
        )];

        let model = IdpWriteModel::fold(&events);
        assert_eq!(model.provider, "google");
        assert!(matches!(model.kind, Some(IdpKind::Oidc(_))));
    }

    #[test]
    fn test_changed_and_lifecycle() {
        let events = vec![
            stored(
                1,
                OIDC_ADDED,
                json!({
                    "name": "corp-sso",
                    "kind": "oidc",
                    "issuer": "https://issuer.example.com",
                    "client_id": "cid",
                    "client_secret": "secret"
                }),
            ),
            stored(2, CHANGED, json!({"name": "corp-login", "is_auto_creation": true})),
            stored(3, DEACTIVATED, json!({})),
        ];

        let model = IdpWriteModel::fold(&events);
        assert_eq!(model.common.name, "corp-login");
        assert!(model.common.is_auto_creation);
        assert_eq!(model.state, IdpState::Inactive);
    }

    #[test]
    fn test_payload_roundtrip_tagged_kind() {
        let payload = IdpAddedPayload {
            common: IdpCommon {
                name: "jwt-idp".to_string(),
                ..Default::default()
            },
            kind: IdpKind::Jwt(JwtIdpConfig {
                issuer: "https://issuer".to_string(),
                jwt_endpoint: "https://issuer/jwt".to_string(),
                keys_endpoint: "https://issuer/keys".to_string(),
                header_name: "x-auth".to_string(),
                public_key_pem: None,
            }),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "jwt");
        let back: IdpAddedPayload = serde_json::from_value(value).unwrap();
        assert!(matches!(back.kind, IdpKind::Jwt(_)));
    }
}
