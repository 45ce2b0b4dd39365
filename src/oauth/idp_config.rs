//! Provider façades for federated identity providers
//!
//! Each helper takes the small provider-specific input and returns a fully
//! populated generic OIDC configuration. Apple is the odd one out: its
//! client secret is an ES256 JWT minted from the developer key.

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::aggregate::idp::OidcIdpConfig;

pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";
pub const APPLE_ISSUER: &str = "https://appleid.apple.com";

/// Apple caps client-secret lifetime at six months
const APPLE_SECRET_LIFETIME_DAYS: i64 = 180;

#[derive(Debug, thiserror::Error)]
pub enum IdpConfigError {
    #[error("invalid Apple private key: {0}")]
    AppleKey(#[from] jsonwebtoken::errors::Error),
}

/// Google Sign-In: fixed issuer, standard scopes
pub fn google(client_id: &str, client_secret: &str) -> OidcIdpConfig {
    OidcIdpConfig {
        issuer: GOOGLE_ISSUER.to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        scopes: vec![
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
        ],
    }
}

/// Azure AD: issuer derived from the tenant (`common` for multi-tenant)
pub fn azure_ad(client_id: &str, client_secret: &str, tenant: Option<&str>) -> OidcIdpConfig {
    let tenant = tenant.unwrap_or("common");
    OidcIdpConfig {
        issuer: format!("https://login.microsoftonline.com/{tenant}/v2.0"),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        scopes: vec![
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
        ],
    }
}

/// GitHub exposes OAuth2 endpoints but is configured through the OIDC shape
/// here; the issuer doubles as the provider marker.
pub fn github(client_id: &str, client_secret: &str) -> OidcIdpConfig {
    OidcIdpConfig {
        issuer: "https://github.com".to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        scopes: vec!["read:user".to_string(), "user:email".to_string()],
    }
}

pub fn gitlab(client_id: &str, client_secret: &str) -> OidcIdpConfig {
    OidcIdpConfig {
        issuer: "https://gitlab.com".to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        scopes: vec![
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
        ],
    }
}

#[derive(Debug, Serialize)]
struct AppleSecretClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'a str,
    sub: &'a str,
}

/// Sign In with Apple: synthesize the client secret as an ES256 JWT signed
/// with the developer's private key (`iss` = team id, `sub` = client id).
pub fn apple(
    client_id: &str,
    team_id: &str,
    key_id: &str,
    private_key_pem: &[u8],
) -> Result<OidcIdpConfig, IdpConfigError> {
    let now = Utc::now();
    let claims = AppleSecretClaims {
        iss: team_id,
        iat: now.timestamp(),
        exp: (now + Duration::days(APPLE_SECRET_LIFETIME_DAYS)).timestamp(),
        aud: APPLE_ISSUER,
        sub: client_id,
    };

    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(key_id.to_string());
    let key = EncodingKey::from_ec_pem(private_key_pem)?;
    let client_secret = encode(&header, &claims, &key)?;

    Ok(OidcIdpConfig {
        issuer: APPLE_ISSUER.to_string(),
        client_id: client_id.to_string(),
        client_secret,
        scopes: vec!["name".to_string(), "email".to_string()],
    })
}
