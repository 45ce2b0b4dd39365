//! Dynamic client registration (RFC 7591/7592)
//!
//! Validates requested client metadata and fills protocol defaults before
//! the command layer persists the application.

use serde::{Deserialize, Serialize};

use super::{
    OAuthError, OAuthErrorCode, GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS,
    GRANT_DEVICE_CODE, GRANT_JWT_BEARER, GRANT_REFRESH_TOKEN, RESPONSE_TYPE_CODE,
};

pub const AUTH_METHOD_BASIC: &str = "client_secret_basic";
pub const AUTH_METHOD_POST: &str = "client_secret_post";
pub const AUTH_METHOD_NONE: &str = "none";

const KNOWN_GRANT_TYPES: &[&str] = &[
    GRANT_AUTHORIZATION_CODE,
    GRANT_REFRESH_TOKEN,
    GRANT_CLIENT_CREDENTIALS,
    GRANT_DEVICE_CODE,
    GRANT_JWT_BEARER,
];

const KNOWN_AUTH_METHODS: &[&str] = &[AUTH_METHOD_BASIC, AUTH_METHOD_POST, AUTH_METHOD_NONE];

/// Client metadata as submitted to the registration endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMetadata {
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Metadata after validation and defaulting
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedMetadata {
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub client_name: String,
}

fn metadata_error(description: impl Into<String>) -> OAuthError {
    OAuthError::with_description(OAuthErrorCode::InvalidClientMetadata, description)
}

/// Syntactic redirect URI check: absolute URI, no fragment, HTTPS for web
/// apps with a loopback exception.
fn validate_redirect_uri(uri: &str) -> Result<(), OAuthError> {
    let invalid =
        |msg: &str| OAuthError::with_description(OAuthErrorCode::InvalidRedirectUri, format!("{uri}: {msg}"));

    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| invalid("not an absolute URI"))?;
    if scheme.is_empty() || rest.is_empty() {
        return Err(invalid("not an absolute URI"));
    }
    if uri.contains('#') {
        return Err(invalid("must not contain a fragment"));
    }
    match scheme {
        "https" => Ok(()),
        "http" => {
            let host = rest
                .split(['/', ':', '?'])
                .next()
                .unwrap_or_default();
            if host == "localhost" || host == "127.0.0.1" || host == "[::1]" {
                Ok(())
            } else {
                Err(invalid("http is only allowed for localhost"))
            }
        }
        // Private-use schemes for native apps (e.g. com.example.app:/cb)
        // are accepted as long as the URI is absolute.
        _ => Ok(()),
    }
}

/// Validate metadata and apply RFC 7591 defaults
pub fn validate(metadata: ClientMetadata) -> Result<ValidatedMetadata, OAuthError> {
    let grant_types = if metadata.grant_types.is_empty() {
        vec![GRANT_AUTHORIZATION_CODE.to_string()]
    } else {
        metadata.grant_types
    };
    // response_types defaults to ["code"] only where the paired grant is
    // present; a client_credentials-only client has no response type.
    let response_types = if metadata.response_types.is_empty() {
        if grant_types.iter().any(|g| g == GRANT_AUTHORIZATION_CODE) {
            vec![RESPONSE_TYPE_CODE.to_string()]
        } else {
            Vec::new()
        }
    } else {
        metadata.response_types
    };

    for grant in &grant_types {
        if !KNOWN_GRANT_TYPES.contains(&grant.as_str()) {
            return Err(metadata_error(format!("unknown grant_type {grant:?}")));
        }
    }
    for response_type in &response_types {
        if response_type != RESPONSE_TYPE_CODE {
            return Err(metadata_error(format!(
                "unsupported response_type {response_type:?}"
            )));
        }
    }

    // Grant and response types must be consistent pairs
    let wants_code_grant = grant_types.iter().any(|g| g == GRANT_AUTHORIZATION_CODE);
    let wants_code_response = response_types.iter().any(|r| r == RESPONSE_TYPE_CODE);
    if wants_code_response && !wants_code_grant {
        return Err(metadata_error(
            "response_type \"code\" requires the authorization_code grant",
        ));
    }

    if wants_code_grant {
        if metadata.redirect_uris.is_empty() {
            return Err(OAuthError::with_description(
                OAuthErrorCode::InvalidRedirectUri,
                "authorization_code clients need at least one redirect_uri",
            ));
        }
        for uri in &metadata.redirect_uris {
            validate_redirect_uri(uri)?;
        }
    }

    let auth_method = metadata
        .token_endpoint_auth_method
        .unwrap_or_else(|| AUTH_METHOD_BASIC.to_string());
    if !KNOWN_AUTH_METHODS.contains(&auth_method.as_str()) {
        return Err(metadata_error(format!(
            "unknown token_endpoint_auth_method {auth_method:?}"
        )));
    }

    Ok(ValidatedMetadata {
        redirect_uris: metadata.redirect_uris,
        grant_types,
        response_types,
        token_endpoint_auth_method: auth_method,
        client_name: metadata.client_name.unwrap_or_else(|| "registered client".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ClientMetadata {
        ClientMetadata {
            redirect_uris: vec!["https://app.example.com/cb".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let validated = validate(base()).unwrap();
        assert_eq!(validated.grant_types, vec![GRANT_AUTHORIZATION_CODE]);
        assert_eq!(validated.response_types, vec![RESPONSE_TYPE_CODE]);
        assert_eq!(validated.token_endpoint_auth_method, AUTH_METHOD_BASIC);
    }

    #[test]
    fn test_http_localhost_allowed_https_required_elsewhere() {
        let mut metadata = base();
        metadata.redirect_uris = vec!["http://localhost:8080/cb".to_string()];
        assert!(validate(metadata).is_ok());

        let mut metadata = base();
        metadata.redirect_uris = vec!["http://app.example.com/cb".to_string()];
        let err = validate(metadata).unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidRedirectUri);
    }

    #[test]
    fn test_fragment_rejected() {
        let mut metadata = base();
        metadata.redirect_uris = vec!["https://app.example.com/cb#frag".to_string()];
        assert!(validate(metadata).is_err());
    }

    #[test]
    fn test_missing_redirect_uri_for_code_grant() {
        let metadata = ClientMetadata::default();
        let err = validate(metadata).unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidRedirectUri);
    }

    #[test]
    fn test_code_response_requires_code_grant() {
        let metadata = ClientMetadata {
            grant_types: vec![GRANT_CLIENT_CREDENTIALS.to_string()],
            response_types: vec![RESPONSE_TYPE_CODE.to_string()],
            ..Default::default()
        };
        let err = validate(metadata).unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidClientMetadata);
    }

    #[test]
    fn test_client_credentials_without_redirects_ok() {
        let metadata = ClientMetadata {
            grant_types: vec![GRANT_CLIENT_CREDENTIALS.to_string()],
            ..Default::default()
        };
        let validated = validate(metadata).unwrap();
        assert!(validated.response_types.is_empty());
        assert!(validated.redirect_uris.is_empty());
    }

    #[test]
    fn test_unknown_grant_rejected() {
        let metadata = ClientMetadata {
            grant_types: vec!["implicit".to_string()],
            ..base()
        };
        assert!(validate(metadata).is_err());
    }
}
