//! Double-submit CSRF tokens for admin mutators.
//!
//! Token form: `token:timestamp:signature`, where signature is
//! HMAC-SHA256(server_secret, "token:timestamp"). The cookie-bound copy and
//! the `X-CSRF-Token` header must match byte for byte; the signature stops
//! forgery even when the cookie value is readable.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const CSRF_COOKIE_NAME: &str = "third-eye-csrf";
pub const CSRF_TOKEN_HEADER: &str = "X-CSRF-Token";

pub struct CsrfSigner {
    secret: Vec<u8>,
    ttl_seconds: i64,
}

impl CsrfSigner {
    pub fn new(secret: &str, ttl_seconds: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl_seconds: ttl_seconds as i64,
        }
    }

    pub fn issue(&self) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(&token, timestamp);
        format!("{}:{}:{}", token, timestamp, signature)
    }

    /// Verifies structure, timestamp window (absolute skew in either
    /// direction), and HMAC signature in constant time.
    pub fn verify(&self, token: &str) -> bool {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() != 3 {
            return false;
        }
        let (value, timestamp_str, signature) = (parts[0], parts[1], parts[2]);
        let Ok(timestamp) = timestamp_str.parse::<i64>() else {
            return false;
        };
        if (chrono::Utc::now().timestamp() - timestamp).abs() > self.ttl_seconds {
            return false;
        }
        let Ok(signature_bytes) = hex::decode(signature) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(format!("{}:{}", value, timestamp).as_bytes());
        mac.verify_slice(&signature_bytes).is_ok()
    }

    fn sign(&self, token: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(format!("{}:{}", token, timestamp).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
