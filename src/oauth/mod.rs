//! OAuth 2.0 / OIDC engine
//!
//! Everything between the command layer and the protocol surface: PKCE,
//! code generation, token issuance and introspection, grant handling,
//! DPoP proof validation, dynamic client registration and the provider
//! façades for federated identity providers.

pub mod codes;
pub mod dpop;
pub mod grants;
pub mod idp_config;
pub mod pkce;
pub mod registration;
pub mod tokens;

use serde::{Deserialize, Serialize};

// Grant types
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const GRANT_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

// Response types
pub const RESPONSE_TYPE_CODE: &str = "code";

// Scopes with wired-in behavior
pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";

/// Standard OAuth error codes (RFC 6749 §5.2, RFC 8628 §3.5, RFC 9449)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    AccessDenied,
    AuthorizationPending,
    SlowDown,
    ExpiredToken,
    InvalidDpopProof,
    InvalidClientMetadata,
    InvalidRedirectUri,
}

impl OAuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorCode::InvalidRequest => "invalid_request",
            OAuthErrorCode::InvalidClient => "invalid_client",
            OAuthErrorCode::InvalidGrant => "invalid_grant",
            OAuthErrorCode::UnauthorizedClient => "unauthorized_client",
            OAuthErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorCode::InvalidScope => "invalid_scope",
            OAuthErrorCode::AccessDenied => "access_denied",
            OAuthErrorCode::AuthorizationPending => "authorization_pending",
            OAuthErrorCode::SlowDown => "slow_down",
            OAuthErrorCode::ExpiredToken => "expired_token",
            OAuthErrorCode::InvalidDpopProof => "invalid_dpop_proof",
            OAuthErrorCode::InvalidClientMetadata => "invalid_client_metadata",
            OAuthErrorCode::InvalidRedirectUri => "invalid_redirect_uri",
        }
    }
}

impl std::fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level error carried to the transport as `{error, error_description}`
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {description:?}")]
pub struct OAuthError {
    pub code: OAuthErrorCode,
    pub description: Option<String>,
}

impl OAuthError {
    pub fn new(code: OAuthErrorCode) -> Self {
        Self {
            code,
            description: None,
        }
    }

    pub fn with_description(code: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(OAuthErrorCode::AuthorizationPending.as_str(), "authorization_pending");
        assert_eq!(OAuthErrorCode::SlowDown.as_str(), "slow_down");
        assert_eq!(
            serde_json::to_value(OAuthErrorCode::ExpiredToken).unwrap(),
            serde_json::json!("expired_token")
        );
    }
}
