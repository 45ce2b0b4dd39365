//! Opaque code and secret generation
//!
//! Device codes, user codes, authorization codes and token secrets. Secrets
//! are never stored; events carry their sha256 hex digest.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Uppercase alphanumerics minus the ambiguous O/0/I/1
const USER_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a user-typeable code, `XXXX-XXXX`
pub fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.gen_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Generate a high-entropy opaque code (256 bits, hex)
pub fn generate_device_code() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Generate an opaque secret (128 bits, hex) for codes and tokens
pub fn generate_secret() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// sha256 hex digest of a secret, the form stored in events
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Constant shape `id.secret` used for authorization codes and opaque tokens:
/// the id locates the aggregate, the secret authenticates the bearer.
pub fn compose_opaque(id: &str, secret: &str) -> String {
    format!("{id}.{secret}")
}

/// Split an opaque `id.secret` value; `None` when the shape is wrong
pub fn split_opaque(value: &str) -> Option<(&str, &str)> {
    let (id, secret) = value.split_once('.')?;
    if id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((id, secret))
}

/// Verify a presented secret against a stored hash
pub fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    hash_secret(secret) == stored_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_code_shape() {
        for _ in 0..100 {
            let code = generate_user_code();
            assert_eq!(code.len(), 9);
            let (left, right) = code.split_once('-').unwrap();
            assert_eq!(left.len(), 4);
            assert_eq!(right.len(), 4);
            for c in left.chars().chain(right.chars()) {
                assert!(USER_CODE_ALPHABET.contains(&(c as u8)), "bad char {c}");
                assert!(!"O0I1".contains(c));
            }
        }
    }

    #[test]
    fn test_device_code_entropy() {
        let code = generate_device_code();
        assert_eq!(code.len(), 64);
        assert_ne!(generate_device_code(), generate_device_code());
    }

    #[test]
    fn test_opaque_roundtrip() {
        let token = compose_opaque("tok-1", "s3cret");
        assert_eq!(split_opaque(&token), Some(("tok-1", "s3cret")));
        assert_eq!(split_opaque("no-dot"), None);
        assert_eq!(split_opaque(".empty-id"), None);
    }

    #[test]
    fn test_secret_hash_verify() {
        let secret = generate_secret();
        let hash = hash_secret(&secret);
        assert!(verify_secret(&secret, &hash));
        assert!(!verify_secret("other", &hash));
    }
}
