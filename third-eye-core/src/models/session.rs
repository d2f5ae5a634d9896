use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One logical conversation between a host agent and the Overseer.
/// Owned by the session store; callers only ever see value copies.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub tenant: Option<String>,
    pub user_id: Option<String>,
    pub lang: String,
    pub budget_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String, ttl_seconds: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant: None,
            user_id: None,
            lang: "auto".to_string(),
            budget_tokens: 0,
            created_at: now,
            last_activity: now,
            expires_at: now + Duration::seconds(ttl_seconds as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Mutable subset applied through `SessionStore::update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDiff {
    pub tenant: Option<String>,
    pub user_id: Option<String>,
    pub lang: Option<String>,
    pub budget_tokens: Option<i64>,
}
