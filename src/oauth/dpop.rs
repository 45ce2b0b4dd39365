//! DPoP proof validation (RFC 9449)
//!
//! A proof is a JWT signed with the client's own key, carried in the `DPoP`
//! header. Validation pins the HTTP method and URL, bounds `iat` skew,
//! rejects replayed `jti`s within a short window, and on bound use compares
//! the access-token hash and the RFC 7638 key thumbprint.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Signature algorithms acceptable in a proof; symmetric families would let
/// the server mint proofs itself and are rejected.
const ASYMMETRIC_ALGS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Default acceptable clock skew for `iat`
pub const DEFAULT_MAX_SKEW_SECS: i64 = 60;

/// Default replay window for `jti` tracking
pub const DEFAULT_REPLAY_WINDOW_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum DpopError {
    #[error("proof is not a dpop+jwt")]
    WrongType,

    #[error("proof algorithm must be asymmetric")]
    ForbiddenAlgorithm,

    #[error("proof header carries no jwk")]
    MissingJwk,

    #[error("htm does not match request method")]
    MethodMismatch,

    #[error("htu does not match request url")]
    UrlMismatch,

    #[error("iat outside acceptable skew")]
    StaleProof,

    #[error("jti already seen")]
    Replay,

    #[error("ath missing or does not match access token")]
    AccessTokenHashMismatch,

    #[error("key thumbprint does not match bound key")]
    KeyMismatch,

    #[error("unsupported jwk for thumbprint")]
    UnsupportedKey,

    #[error("invalid proof jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    htm: String,
    htu: String,
    iat: i64,
    jti: String,
    #[serde(default)]
    ath: Option<String>,
}

/// Outcome of a successful proof validation
#[derive(Debug, Clone)]
pub struct VerifiedProof {
    /// RFC 7638 thumbprint of the proof key, recorded as `dpop_jkt`
    pub jkt: String,
    pub jti: String,
}

/// Compute the RFC 7638 JWK thumbprint: sha256 over the canonical JSON of
/// the required members, base64url without padding. serde_json maps are
/// BTree-backed, so serialization already orders members lexicographically.
pub fn jwk_thumbprint(jwk: &Jwk) -> Result<String, DpopError> {
    let value = serde_json::to_value(jwk).map_err(|_| DpopError::UnsupportedKey)?;
    let kty = value["kty"].as_str().ok_or(DpopError::UnsupportedKey)?;

    let members: &[&str] = match kty {
        "RSA" => &["e", "kty", "n"],
        "EC" => &["crv", "kty", "x", "y"],
        "OKP" => &["crv", "kty", "x"],
        _ => return Err(DpopError::UnsupportedKey),
    };

    let mut canonical = serde_json::Map::new();
    for member in members {
        let field = value
            .get(*member)
            .and_then(|v| v.as_str())
            .ok_or(DpopError::UnsupportedKey)?;
        canonical.insert((*member).to_string(), serde_json::Value::from(field));
    }

    let json = serde_json::to_string(&serde_json::Value::Object(canonical))
        .map_err(|_| DpopError::UnsupportedKey)?;
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(json.as_bytes())))
}

/// base64url(sha256(access_token)), the expected `ath` claim value
pub fn access_token_hash(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

/// Strip query and fragment for `htu` comparison
fn normalize_htu(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Short-TTL `jti` set, scoped per instance. The only synchronization
/// point of the DPoP layer.
pub struct ReplayCache {
    seen: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    window: Duration,
}

impl ReplayCache {
    pub fn new(window_secs: i64) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window: Duration::seconds(window_secs),
        }
    }

    /// Record `jti` for the instance; `false` if it was already present
    pub async fn check_and_insert(&self, instance_id: &str, jti: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().await;
        let key = (instance_id.to_string(), jti.to_string());
        if let Some(seen_at) = seen.get(&key) {
            if now < *seen_at + self.window {
                return false;
            }
        }
        seen.insert(key, now);
        true
    }

    /// Drop entries older than the window
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        let window = self.window;
        seen.retain(|_, seen_at| now < *seen_at + window);
        before - seen.len()
    }

    /// Periodic sweep in the background; aborts with the returned handle
    pub fn start_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep(Utc::now()).await;
                if removed > 0 {
                    tracing::debug!(removed = removed, "Swept DPoP replay cache");
                }
            }
        })
    }
}

/// Validator carrying the skew window and replay cache
pub struct DpopValidator {
    pub max_skew: Duration,
    pub replay_cache: Arc<ReplayCache>,
}

impl DpopValidator {
    pub fn new() -> Self {
        Self {
            max_skew: Duration::seconds(DEFAULT_MAX_SKEW_SECS),
            replay_cache: Arc::new(ReplayCache::new(DEFAULT_REPLAY_WINDOW_SECS)),
        }
    }

    /// Validate a proof for a request.
    ///
    /// `access_token` is the token the proof accompanies (protected-resource
    /// or introspection use); issuance passes `None`. `bound_jkt` is the
    /// thumbprint recorded at issuance for bound tokens.
    pub async fn verify(
        &self,
        instance_id: &str,
        proof: &str,
        method: &str,
        url: &str,
        access_token: Option<&str>,
        bound_jkt: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<VerifiedProof, DpopError> {
        let header = decode_header(proof)?;

        if header.typ.as_deref() != Some("dpop+jwt") {
            return Err(DpopError::WrongType);
        }
        if !ASYMMETRIC_ALGS.contains(&header.alg) {
            return Err(DpopError::ForbiddenAlgorithm);
        }
        let jwk: Jwk = header.jwk.ok_or(DpopError::MissingJwk)?;

        let key = DecodingKey::from_jwk(&jwk)?;
        let mut validation = Validation::new(header.alg);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;
        let claims = decode::<ProofClaims>(proof, &key, &validation)?.claims;

        if !claims.htm.eq_ignore_ascii_case(method) {
            return Err(DpopError::MethodMismatch);
        }
        if normalize_htu(&claims.htu) != normalize_htu(url) {
            return Err(DpopError::UrlMismatch);
        }

        let iat = DateTime::<Utc>::from_timestamp(claims.iat, 0).ok_or(DpopError::StaleProof)?;
        if iat < now - self.max_skew || iat > now + self.max_skew {
            return Err(DpopError::StaleProof);
        }

        if !self
            .replay_cache
            .check_and_insert(instance_id, &claims.jti, now)
            .await
        {
            return Err(DpopError::Replay);
        }

        let jkt = jwk_thumbprint(&jwk)?;

        if let Some(token) = access_token {
            match claims.ath.as_deref() {
                Some(ath) if ath == access_token_hash(token) => {}
                _ => return Err(DpopError::AccessTokenHashMismatch),
            }
        }
        if let Some(bound) = bound_jkt {
            if bound != jkt {
                return Err(DpopError::KeyMismatch);
            }
        }

        Ok(VerifiedProof {
            jkt,
            jti: claims.jti,
        })
    }
}

impl Default for DpopValidator {
    fn default() -> Self {
        Self::new()
    }
}
