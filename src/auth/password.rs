//! Argon2id password hashing.
//!
//! Digests are PHC strings (`$argon2id$...`) carrying algorithm, parameters
//! and a per-hash random salt, so the same password never produces the same
//! digest twice and parameters can be upgraded without a schema change.
//! A malformed stored digest verifies as a non-match, never a crash.

use anyhow::Result;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use std::sync::OnceLock;

/// Hash a password with a fresh random salt.
pub fn hash(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|digest| digest.to_string())
        .map_err(|e| anyhow::anyhow!("Password hashing failed: {e}"))
}

/// Verify a password against a stored PHC digest.
pub fn verify(password: &str, digest: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(digest) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

static DUMMY_DIGEST: OnceLock<String> = OnceLock::new();

/// Digest verified against when no account matches a login attempt, so an
/// unknown email costs the same as a wrong password.
pub fn dummy_digest() -> &'static str {
    DUMMY_DIGEST.get_or_init(|| hash("keygate.dummy.credential").unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let digest = hash("correct horse battery staple").unwrap();
        assert!(digest.starts_with("$argon2id$"));
        assert!(verify("correct horse battery staple", &digest));
        assert!(!verify("correct horse battery stable", &digest));
    }

    #[test]
    fn same_password_hashes_differently() {
        let first = hash("hunter2hunter2").unwrap();
        let second = hash("hunter2hunter2").unwrap();
        assert_ne!(first, second);
        assert!(verify("hunter2hunter2", &first));
        assert!(verify("hunter2hunter2", &second));
    }

    #[test]
    fn malformed_digest_is_a_non_match() {
        assert!(!verify("anything", ""));
        assert!(!verify("anything", "not-a-phc-string"));
        assert!(!verify("anything", "$argon2id$v=19$truncated"));
    }

    #[test]
    fn dummy_digest_never_matches() {
        assert!(!verify("password123", dummy_digest()));
        assert!(!verify("", dummy_digest()));
    }
}
