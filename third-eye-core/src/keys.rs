//! API-key material: generation and salted hashing.
//!
//! Raw secrets are transmitted once (`X-API-Key` header, login response)
//! and stored only as hex(sha256(salt || secret)).

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a new raw API key secret.
pub fn generate_api_key() -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("te_{}", hex::encode(raw))
}

/// Opaque key id, usable in URLs and audit rows.
pub fn generate_key_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("key_{}", hex::encode(raw))
}

pub fn hash_api_key(raw: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Password hashing for the seeded admin account uses the same salted
/// SHA-256 construction.
pub fn hash_password(password: &str, salt: &str) -> String {
    hash_api_key(password, salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_unique_and_prefixed() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert!(a.starts_with("te_"));
        assert_eq!(a.len(), 3 + 48);
    }

    #[test]
    fn hashing_is_deterministic_and_salt_sensitive() {
        let h1 = hash_api_key("secret", "salt-a");
        let h2 = hash_api_key("secret", "salt-a");
        let h3 = hash_api_key("secret", "salt-b");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }
}
