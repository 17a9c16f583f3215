//! PBKDF2-HMAC-SHA256 password hashing.
//!
//! Per-user 16-byte random salt, 100 000 iterations. Verification goes
//! through `ring::pbkdf2::verify`, which compares in constant time.

use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, pbkdf2};
use std::num::NonZeroU32;

use crate::error::{Result, UserError};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 16;
const CREDENTIAL_LEN: usize = digest::SHA256_OUTPUT_LEN;

static ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// Salt + derived hash, ready for storage (hex-encoded by the store).
pub struct DerivedPassword {
    pub salt: [u8; SALT_LEN],
    pub hash: [u8; CREDENTIAL_LEN],
    pub iterations: u32,
}

/// Derive a storable hash from a plaintext password with a fresh salt.
pub fn derive(password: &str) -> Result<DerivedPassword> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| UserError::Crypto("salt generation failed".to_string()))?;

    let mut hash = [0u8; CREDENTIAL_LEN];
    pbkdf2::derive(
        ALGORITHM,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("iteration count is non-zero"),
        &salt,
        password.as_bytes(),
        &mut hash,
    );

    Ok(DerivedPassword {
        salt,
        hash,
        iterations: PBKDF2_ITERATIONS,
    })
}

/// Constant-time verification against a stored salt/hash pair.
///
/// The stored iteration count is honored so old hashes keep verifying
/// if the default is ever raised.
pub fn verify(password: &str, salt: &[u8], iterations: u32, expected_hash: &[u8]) -> bool {
    let Some(iterations) = NonZeroU32::new(iterations) else {
        return false;
    };
    pbkdf2::verify(
        ALGORITHM,
        iterations,
        salt,
        password.as_bytes(),
        expected_hash,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_then_verify() {
        let derived = derive("correct horse battery staple").unwrap();
        assert!(verify(
            "correct horse battery staple",
            &derived.salt,
            derived.iterations,
            &derived.hash
        ));
        assert!(!verify(
            "wrong password",
            &derived.salt,
            derived.iterations,
            &derived.hash
        ));
    }

    #[test]
    fn salts_are_unique_per_derivation() {
        let a = derive("same password").unwrap();
        let b = derive("same password").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn zero_iterations_never_verifies() {
        let derived = derive("pw").unwrap();
        assert!(!verify("pw", &derived.salt, 0, &derived.hash));
    }
}
