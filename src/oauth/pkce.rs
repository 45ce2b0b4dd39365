//! PKCE verification (RFC 7636)

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::aggregate::auth_request::CodeChallengeMethod;

/// Compute the S256 challenge for a verifier
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Verify a code verifier against the stored challenge
pub fn verify(challenge: &str, method: CodeChallengeMethod, verifier: &str) -> bool {
    match method {
        CodeChallengeMethod::Plain => challenge == verifier,
        CodeChallengeMethod::S256 => s256_challenge(verifier) == challenge,
    }
}
