use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audit row per request outcome, including rejections. Written
/// best-effort through the persistence adapter.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: Uuid,
    pub tenant: Option<String>,
    pub key_id: Option<String>,
    pub action: String,
    pub code: String,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        tenant: Option<&str>,
        key_id: Option<&str>,
        action: &str,
        code: &str,
        trace_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant: tenant.map(str::to_string),
            key_id: key_id.map(str::to_string),
            action: action.to_string(),
            code: code.to_string(),
            trace_id: trace_id.to_string(),
            created_at: Utc::now(),
        }
    }
}
