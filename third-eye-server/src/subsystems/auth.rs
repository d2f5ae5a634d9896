//! Authentication: API-key validation, per-key rate limiting, and admin
//! sessions.
//!
//! Key lookups are cache-backed: the in-memory cache answers repeat
//! requests, the persistence adapter answers cold ones. Revocation and
//! expiry are enforced on every request regardless of cache state.
//! Admin sessions live for one hour and are extended by every admin
//! request that presents them; expiry forces re-login.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use third_eye_core::keys;
use third_eye_core::models::{ApiKeyRecord, ROLE_ADMIN};
use third_eye_core::Persistence;

const KEY_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `X-API-Key` header, unknown key, revoked, or expired. All of
    /// these surface as `E_AUTH_REQUIRED` with 401.
    Unauthorized,
    /// Per-key rate exhausted. Surfaces as `E_QUOTA_EXCEEDED` with 429.
    RateLimited { retry_after_seconds: u64 },
    /// Valid key but not admin. Surfaces as 403.
    Forbidden,
    /// Admin session past its TTL. Surfaces as `E_SESSION_EXPIRED`.
    AdminSessionExpired,
}

#[derive(Debug, Clone)]
pub struct AdminSession {
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct CachedKey {
    record: ApiKeyRecord,
    cached_at: Instant,
}

pub struct AuthManager {
    persistence: Persistence,
    salt: String,
    /// hash -> cached record. Local keys (bootstrap, admin-issued) live
    /// here authoritatively when persistence is disabled.
    cache: Mutex<HashMap<String, CachedKey>>,
    admin_sessions: Mutex<HashMap<String, AdminSession>>,
    /// key id -> minute bucket -> count.
    key_rate: Mutex<HashMap<String, HashMap<i64, u32>>>,
    key_rate_per_minute: u32,
    admin_session_ttl_seconds: u64,
}

impl AuthManager {
    pub fn new(
        persistence: Persistence,
        salt: &str,
        key_rate_per_minute: u32,
        admin_session_ttl_seconds: u64,
    ) -> Self {
        Self {
            persistence,
            salt: salt.to_string(),
            cache: Mutex::new(HashMap::new()),
            admin_sessions: Mutex::new(HashMap::new()),
            key_rate: Mutex::new(HashMap::new()),
            key_rate_per_minute,
            admin_session_ttl_seconds,
        }
    }

    pub fn hash(&self, raw: &str) -> String {
        keys::hash_api_key(raw, &self.salt)
    }

    /// Validate the raw header value and load the key record. The hash
    /// never leaves this layer.
    pub async fn authenticate(&self, raw_key: Option<&str>) -> Result<ApiKeyRecord, AuthError> {
        let raw = match raw_key {
            Some(raw) if !raw.trim().is_empty() => raw.trim(),
            _ => return Err(AuthError::Unauthorized),
        };
        let hash = self.hash(raw);

        if let Some(record) = self.cached(&hash) {
            return self.gate(record);
        }

        let record = self
            .persistence
            .fetch_api_key_by_hash(&hash)
            .await
            .map_err(|e| {
                tracing::warn!("api key lookup failed: {}", e);
                AuthError::Unauthorized
            })?
            .ok_or(AuthError::Unauthorized)?;

        self.insert_cache(record.clone());
        self.gate(record)
    }

    fn gate(&self, record: ApiKeyRecord) -> Result<ApiKeyRecord, AuthError> {
        if !record.is_usable(Utc::now()) {
            tracing::info!("rejected unusable api key {}", record.id);
            return Err(AuthError::Unauthorized);
        }
        Ok(record)
    }

    /// Per-key minute-bucket rate check. Runs after the tenant quota
    /// check; tenant limits take precedence.
    pub fn check_key_rate(&self, record: &ApiKeyRecord) -> Result<(), AuthError> {
        let rate = record
            .limits()
            .rate_per_minute
            .unwrap_or(self.key_rate_per_minute);
        if rate == 0 {
            return Ok(());
        }
        let minute = Utc::now().timestamp() / 60;
        let mut buckets = self.key_rate.lock().unwrap_or_else(|e| e.into_inner());
        let per_key = buckets.entry(record.id.clone()).or_default();
        per_key.retain(|m, _| *m >= minute);
        let count = per_key.entry(minute).or_insert(0);
        if *count >= rate {
            return Err(AuthError::RateLimited {
                retry_after_seconds: 60 - (Utc::now().timestamp() % 60) as u64,
            });
        }
        *count += 1;
        Ok(())
    }

    /// Register a freshly generated key: cache it and persist it.
    pub async fn register_key(&self, record: ApiKeyRecord) {
        if let Err(e) = self.persistence.upsert_api_key(&record).await {
            tracing::warn!("api key persist failed (key stays cached): {}", e);
        }
        self.insert_cache(record);
    }

    pub async fn revoke_key(&self, key_id: &str) -> bool {
        let mut revoked = false;
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            for cached in cache.values_mut() {
                if cached.record.id == key_id && cached.record.revoked_at.is_none() {
                    cached.record.revoked_at = Some(Utc::now());
                    revoked = true;
                }
            }
        }
        match self.persistence.revoke_api_key(key_id).await {
            Ok(db_revoked) => revoked || db_revoked,
            Err(e) => {
                tracing::warn!("api key revoke persist failed: {}", e);
                revoked
            }
        }
    }

    pub async fn list_keys(&self) -> Vec<ApiKeyRecord> {
        if self.persistence.is_enabled() {
            match self.persistence.list_api_keys().await {
                Ok(records) => return records,
                Err(e) => tracing::warn!("api key list failed, serving cache: {}", e),
            }
        }
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.values().map(|c| c.record.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Admin sessions
    // ------------------------------------------------------------------

    pub fn create_admin_session(&self, key_id: &str) -> AdminSession {
        let now = Utc::now();
        let session = AdminSession {
            key_id: key_id.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.admin_session_ttl_seconds as i64),
        };
        self.admin_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_id.to_string(), session.clone());
        session
    }

    /// Admin requests must hold a live admin session; presenting it
    /// extends the TTL.
    pub fn require_admin(&self, record: &ApiKeyRecord) -> Result<(), AuthError> {
        if record.role != ROLE_ADMIN {
            return Err(AuthError::Forbidden);
        }
        let now = Utc::now();
        let mut sessions = self
            .admin_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(&record.id) {
            Some(session) if session.expires_at > now => {
                session.expires_at =
                    now + chrono::Duration::seconds(self.admin_session_ttl_seconds as i64);
                Ok(())
            }
            Some(_) => {
                sessions.remove(&record.id);
                Err(AuthError::AdminSessionExpired)
            }
            None => Err(AuthError::AdminSessionExpired),
        }
    }

    pub fn sweep_admin_sessions(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self
            .admin_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    fn cached(&self, hash: &str) -> Option<ApiKeyRecord> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(hash)?;
        // Locally registered keys stay authoritative when there is no
        // database to refresh from.
        if !self.persistence.is_enabled() || entry.cached_at.elapsed() < KEY_CACHE_TTL {
            return Some(entry.record.clone());
        }
        None
    }

    fn insert_cache(&self, record: ApiKeyRecord) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            record.hashed_secret.clone(),
            CachedKey {
                record,
                cached_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> AuthManager {
        AuthManager::new(Persistence::disabled(), "test-salt", 120, 3600)
    }

    fn record_for(manager: &AuthManager, raw: &str, role: &str) -> ApiKeyRecord {
        ApiKeyRecord {
            id: format!("key-{}", raw),
            hashed_secret: manager.hash(raw),
            role: role.to_string(),
            tenant: Some("acme".to_string()),
            display_name: None,
            limits: json!({}),
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn missing_or_unknown_key_is_unauthorized() {
        let auth = manager();
        assert_eq!(auth.authenticate(None).await.unwrap_err(), AuthError::Unauthorized);
        assert_eq!(
            auth.authenticate(Some("  ")).await.unwrap_err(),
            AuthError::Unauthorized
        );
        assert_eq!(
            auth.authenticate(Some("te_nope")).await.unwrap_err(),
            AuthError::Unauthorized
        );
    }

    #[tokio::test]
    async fn registered_key_authenticates_and_loads_tenant() {
        let auth = manager();
        auth.register_key(record_for(&auth, "raw-1", "consumer")).await;
        let record = auth.authenticate(Some("raw-1")).await.unwrap();
        assert_eq!(record.tenant.as_deref(), Some("acme"));
        assert!(!record.is_admin());
    }

    #[tokio::test]
    async fn revoked_key_always_denies() {
        let auth = manager();
        let record = record_for(&auth, "raw-1", "consumer");
        let key_id = record.id.clone();
        auth.register_key(record).await;
        assert!(auth.revoke_key(&key_id).await);
        assert_eq!(
            auth.authenticate(Some("raw-1")).await.unwrap_err(),
            AuthError::Unauthorized
        );
    }

    #[tokio::test]
    async fn expired_key_denies() {
        let auth = manager();
        let mut record = record_for(&auth, "raw-1", "consumer");
        record.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        auth.register_key(record).await;
        assert_eq!(
            auth.authenticate(Some("raw-1")).await.unwrap_err(),
            AuthError::Unauthorized
        );
    }

    #[tokio::test]
    async fn key_rate_limits_per_minute() {
        let auth = manager();
        let mut record = record_for(&auth, "raw-1", "consumer");
        record.limits = json!({"rate_per_minute": 3});
        auth.register_key(record.clone()).await;

        for _ in 0..3 {
            assert!(auth.check_key_rate(&record).is_ok());
        }
        match auth.check_key_rate(&record).unwrap_err() {
            AuthError::RateLimited { retry_after_seconds } => {
                assert!(retry_after_seconds <= 60);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn admin_session_lifecycle() {
        let auth = manager();
        let admin = record_for(&auth, "raw-admin", ROLE_ADMIN);
        auth.register_key(admin.clone()).await;

        // Admin role without a session is an expired-session error.
        assert_eq!(
            auth.require_admin(&admin).unwrap_err(),
            AuthError::AdminSessionExpired
        );

        auth.create_admin_session(&admin.id);
        assert!(auth.require_admin(&admin).is_ok());

        // Consumer keys are forbidden outright.
        let consumer = record_for(&auth, "raw-consumer", "consumer");
        assert_eq!(auth.require_admin(&consumer).unwrap_err(), AuthError::Forbidden);
    }

    #[tokio::test]
    async fn sweep_removes_expired_admin_sessions() {
        let auth = AuthManager::new(Persistence::disabled(), "s", 120, 0);
        let admin = record_for(&auth, "raw-admin", ROLE_ADMIN);
        auth.create_admin_session(&admin.id);
        assert_eq!(auth.sweep_admin_sessions(), 1);
        assert_eq!(
            auth.require_admin(&admin).unwrap_err(),
            AuthError::AdminSessionExpired
        );
    }
}
