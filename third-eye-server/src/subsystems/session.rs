//! Per-connection session state with TTL discipline.
//!
//! The store exclusively owns session rows and the connection → session
//! bindings; callers only ever receive value copies. Updates are
//! serialized by the store lock (single writer per connection), and every
//! successful request touches its session to push the TTL deadline out.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use third_eye_core::envelope::WorkEnvelope;
use third_eye_core::models::{Session, SessionDiff};
use uuid::Uuid;

pub struct SessionStore {
    inner: Mutex<Inner>,
    ttl_seconds: u64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// Exactly one binding per connection id at any instant.
    bindings: HashMap<String, String>,
    /// Envelope parked while the host answers clarification questions.
    pending: HashMap<String, WorkEnvelope>,
}

impl SessionStore {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl_seconds,
        }
    }

    /// Idempotent: a bound connection gets its existing session back; an
    /// unbound one gets a freshly minted session and binding.
    pub fn get_or_create(&self, connection_id: &str) -> Session {
        let mut inner = self.lock();
        if let Some(session_id) = inner.bindings.get(connection_id).cloned() {
            if let Some(session) = inner.sessions.get(&session_id) {
                return session.clone();
            }
        }
        let session_id = format!("sess-{}", Uuid::new_v4().simple());
        let session = Session::new(session_id.clone(), self.ttl_seconds);
        tracing::debug!(
            "created session {} for connection {}",
            session_id,
            connection_id
        );
        inner
            .bindings
            .insert(connection_id.to_string(), session_id.clone());
        inner.sessions.insert(session_id, session.clone());
        session
    }

    pub fn get(&self, connection_id: &str) -> Option<Session> {
        let inner = self.lock();
        let session_id = inner.bindings.get(connection_id)?;
        inner.sessions.get(session_id).cloned()
    }

    pub fn get_by_id(&self, session_id: &str) -> Option<Session> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// Single-writer update under the store lock. Writes
    /// `last_activity = now` whether or not the diff changed anything.
    pub fn update(&self, connection_id: &str, diff: SessionDiff) -> Option<Session> {
        let mut inner = self.lock();
        let session_id = inner.bindings.get(connection_id)?.clone();
        Self::apply_diff(inner.sessions.get_mut(&session_id)?, diff)
    }

    /// Session-scoped variant used by the settings endpoint; same lock,
    /// same last-activity discipline.
    pub fn update_by_id(&self, session_id: &str, diff: SessionDiff) -> Option<Session> {
        let mut inner = self.lock();
        Self::apply_diff(inner.sessions.get_mut(session_id)?, diff)
    }

    fn apply_diff(session: &mut Session, diff: SessionDiff) -> Option<Session> {
        if let Some(tenant) = diff.tenant {
            session.tenant = Some(tenant);
        }
        if let Some(user_id) = diff.user_id {
            session.user_id = Some(user_id);
        }
        if let Some(lang) = diff.lang {
            session.lang = lang;
        }
        if let Some(budget) = diff.budget_tokens {
            session.budget_tokens = budget;
        }
        session.last_activity = Utc::now();
        Some(session.clone())
    }

    /// Extend the TTL window without other changes. Called on every
    /// successful request that used the session.
    pub fn touch(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.sessions.get_mut(session_id) {
            Some(session) => {
                let now = Utc::now();
                session.last_activity = now;
                session.expires_at = now + Duration::seconds(self.ttl_seconds as i64);
                true
            }
            None => false,
        }
    }

    pub fn set_pending_envelope(&self, session_id: &str, envelope: WorkEnvelope) {
        self.lock().pending.insert(session_id.to_string(), envelope);
    }

    pub fn take_pending_envelope(&self, session_id: &str) -> Option<WorkEnvelope> {
        self.lock().pending.remove(session_id)
    }

    /// Remove every session past its TTL deadline, along with its
    /// bindings and parked envelope. Returns the reaped session ids so
    /// the caller can tear down bus topics and persisted rows.
    pub fn cleanup_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &stale {
            inner.sessions.remove(session_id);
            inner.pending.remove(session_id);
            inner.bindings.retain(|_, bound| bound != session_id);
        }
        stale
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent_per_connection() {
        let store = SessionStore::new(60);
        let first = store.get_or_create("conn-1");
        for _ in 0..5 {
            assert_eq!(store.get_or_create("conn-1").id, first.id);
        }
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn distinct_connections_never_share_a_session() {
        let store = SessionStore::new(60);
        let a = store.get_or_create("conn-a");
        let b = store.get_or_create("conn-b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn get_does_not_create() {
        let store = SessionStore::new(60);
        assert!(store.get("conn-unknown").is_none());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn update_writes_last_activity_and_applies_diff() {
        let store = SessionStore::new(60);
        let created = store.get_or_create("conn-1");
        let updated = store
            .update(
                "conn-1",
                SessionDiff {
                    tenant: Some("acme".to_string()),
                    lang: Some("en".to_string()),
                    ..SessionDiff::default()
                },
            )
            .unwrap();
        assert_eq!(updated.tenant.as_deref(), Some("acme"));
        assert_eq!(updated.lang, "en");
        assert!(updated.last_activity >= created.last_activity);
    }

    #[test]
    fn update_by_id_reaches_unbound_sessions() {
        let store = SessionStore::new(60);
        let session = store.get_or_create("conn-1");
        let updated = store
            .update_by_id(
                &session.id,
                SessionDiff {
                    budget_tokens: Some(9000),
                    ..SessionDiff::default()
                },
            )
            .unwrap();
        assert_eq!(updated.budget_tokens, 9000);
        assert!(store.update_by_id("sess-ghost", SessionDiff::default()).is_none());
    }

    #[test]
    fn touch_extends_the_ttl_deadline() {
        let store = SessionStore::new(604_800);
        let session = store.get_or_create("conn-1");
        assert!(store.touch(&session.id));
        let touched = store.get_by_id(&session.id).unwrap();
        assert!(touched.expires_at >= session.expires_at);
        assert!(touched.last_activity >= session.last_activity);
        // A touched session is not reclaimable for nearly the full TTL.
        let almost_ttl = Utc::now() + Duration::seconds(604_800 - 1);
        assert!(!touched.is_expired(almost_ttl));
    }

    #[test]
    fn cleanup_reaps_expired_sessions_and_their_bindings() {
        let store = SessionStore::new(0);
        let session = store.get_or_create("conn-1");
        store.set_pending_envelope(&session.id, WorkEnvelope::default());

        let reaped = store.cleanup_stale(Utc::now() + Duration::seconds(1));
        assert_eq!(reaped, vec![session.id.clone()]);
        assert!(store.get("conn-1").is_none());
        assert!(store.get_by_id(&session.id).is_none());
        assert!(store.take_pending_envelope(&session.id).is_none());

        // A fresh request on the same connection mints a new session.
        let replacement = store.get_or_create("conn-1");
        assert_ne!(replacement.id, session.id);
    }

    #[test]
    fn cleanup_leaves_live_sessions_alone() {
        let store = SessionStore::new(604_800);
        let session = store.get_or_create("conn-1");
        let reaped = store.cleanup_stale(Utc::now());
        assert!(reaped.is_empty());
        assert_eq!(store.get_by_id(&session.id).unwrap().id, session.id);
    }

    #[test]
    fn pending_envelope_round_trips_once() {
        let store = SessionStore::new(60);
        let session = store.get_or_create("conn-1");
        let mut envelope = WorkEnvelope::default();
        envelope.payload.intent = "make it better".to_string();
        store.set_pending_envelope(&session.id, envelope);

        let taken = store.take_pending_envelope(&session.id).unwrap();
        assert_eq!(taken.payload.intent, "make it better");
        assert!(store.take_pending_envelope(&session.id).is_none());
    }
}
