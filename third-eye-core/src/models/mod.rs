pub mod api_key;
pub mod audit;
pub mod session;

pub use api_key::{ApiKeyRecord, ApiKeySummary, KeyLimits, ROLE_ADMIN, ROLE_CONSUMER};
pub use audit::AuditEvent;
pub use session::{Session, SessionDiff};
