//! Session token generation and at-rest hashing.
//!
//! Tokens are 128 random bits, URL-safe base64 on the wire, SHA-256 hex
//! in storage. A database leak therefore never leaks usable bearer tokens.

use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

use crate::error::{Result, SessionError};

const TOKEN_BYTES: usize = 16;

/// Generate a fresh bearer token. Returns `(plaintext, digest_hex)`.
/// The plaintext is handed to the client exactly once.
pub fn generate() -> Result<(String, String)> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| SessionError::Crypto("token generation failed".to_string()))?;
    let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = digest_hex(&token);
    Ok((token, digest))
}

/// SHA-256 hex digest of a wire token, for lookups.
pub fn digest_hex(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let (a, _) = generate().unwrap();
        let (b, _) = generate().unwrap();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 16 bytes → 22 base64 chars without padding.
        assert_eq!(a.len(), 22);
    }

    #[test]
    fn digest_is_stable() {
        let (token, digest) = generate().unwrap();
        assert_eq!(digest, digest_hex(&token));
    }
}
