use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_CONSUMER: &str = "consumer";

/// Stored API key. The raw secret never touches this struct; only its
/// salted hash is kept, and the hash is never serialized outward.
#[derive(Debug, Clone, Deserialize, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: String,
    pub hashed_secret: String,
    pub role: String,
    pub tenant: Option<String>,
    pub display_name: Option<String>,
    pub limits: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Per-key limits blob, stored as JSON so new scopes can land without a
/// migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyLimits {
    #[serde(default)]
    pub rate_per_minute: Option<u32>,
    #[serde(default)]
    pub per_request_budget: Option<i64>,
    #[serde(default)]
    pub total_budget: Option<i64>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub tenants: Vec<String>,
}

impl ApiKeyRecord {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// A revoked key always denies; expiry is absolute wall clock.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires) => expires > now,
            None => true,
        }
    }

    pub fn limits(&self) -> KeyLimits {
        serde_json::from_value(self.limits.clone()).unwrap_or_default()
    }
}

/// Redacted view safe to return from admin listings.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeySummary {
    pub id: String,
    pub role: String,
    pub tenant: Option<String>,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl From<&ApiKeyRecord> for ApiKeySummary {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id.clone(),
            role: record.role.clone(),
            tenant: record.tenant.clone(),
            display_name: record.display_name.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            revoked: record.revoked_at.is_some(),
        }
    }
}
