//! Response protocol shared by every Eye and the Overseer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status-code vocabulary. Codes are plain strings on the wire; the well
/// known ones live here so call sites never typo them.
pub mod codes {
    pub const OK_ALL: &str = "OK_ALL";
    pub const OK_NO_VALIDATION_NEEDED: &str = "OK_NO_VALIDATION_NEEDED";
    pub const OK_NO_CLARIFICATION_NEEDED: &str = "OK_NO_CLARIFICATION_NEEDED";
    pub const OK_INTENT_CONFIRMED: &str = "OK_INTENT_CONFIRMED";
    pub const OK_PLAN_APPROVED: &str = "OK_PLAN_APPROVED";
    pub const OK_CODE_APPROVED: &str = "OK_CODE_APPROVED";
    pub const OK_TEXT_VALIDATED: &str = "OK_TEXT_VALIDATED";
    pub const OK_CONSISTENT: &str = "OK_CONSISTENT";

    pub const E_NEEDS_CLARIFICATION: &str = "E_NEEDS_CLARIFICATION";
    pub const E_INTENT_UNCONFIRMED: &str = "E_INTENT_UNCONFIRMED";
    pub const E_PLAN_INCOMPLETE: &str = "E_PLAN_INCOMPLETE";
    pub const E_CODE_ISSUES: &str = "E_CODE_ISSUES";
    pub const E_UNSUPPORTED_CLAIMS: &str = "E_UNSUPPORTED_CLAIMS";
    pub const E_CONTRADICTION_DETECTED: &str = "E_CONTRADICTION_DETECTED";
    pub const E_PARTIAL_FAIL: &str = "E_PARTIAL_FAIL";

    pub const E_BAD_PAYLOAD_SCHEMA: &str = "E_BAD_PAYLOAD_SCHEMA";
    pub const E_AUTH_REQUIRED: &str = "E_AUTH_REQUIRED";
    pub const E_CSRF_FAILED: &str = "E_CSRF_FAILED";
    pub const E_QUOTA_EXCEEDED: &str = "E_QUOTA_EXCEEDED";
    pub const E_SESSION_EXPIRED: &str = "E_SESSION_EXPIRED";
    pub const E_LLM_ERROR: &str = "E_LLM_ERROR";
    pub const E_ORCHESTRATION_FAILED: &str = "E_ORCHESTRATION_FAILED";
    pub const E_INTERNAL: &str = "E_INTERNAL";
}

/// Codes that stop the pipeline and hand control back to the host for
/// clarification answers.
pub fn is_clarification_code(code: &str) -> bool {
    matches!(code, codes::E_NEEDS_CLARIFICATION)
}

/// Codes that stop the pipeline because the submitted work needs revision
/// before later gates are worth running.
pub fn is_revision_code(code: &str) -> bool {
    matches!(
        code,
        codes::E_PLAN_INCOMPLETE
            | codes::E_CODE_ISSUES
            | codes::E_UNSUPPORTED_CLAIMS
            | codes::E_CONTRADICTION_DETECTED
            | codes::E_INTENT_UNCONFIRMED
    )
}

/// A validator's output. Immutable once published to the bus.
/// `ok` is `None` while the Eye is still in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EyeResult {
    pub eye: String,
    pub ok: Option<bool>,
    pub code: String,
    pub md: String,
    #[serde(default)]
    pub data: Value,
}

impl EyeResult {
    pub fn passed(eye: &str, code: &str, md: impl Into<String>, data: Value) -> Self {
        Self {
            eye: eye.to_string(),
            ok: Some(true),
            code: code.to_string(),
            md: md.into(),
            data,
        }
    }

    pub fn failed(eye: &str, code: &str, md: impl Into<String>, data: Value) -> Self {
        Self {
            eye: eye.to_string(),
            ok: Some(false),
            code: code.to_string(),
            md: md.into(),
            data,
        }
    }

    pub fn requires_clarification(&self) -> bool {
        self.ok == Some(false) && is_clarification_code(&self.code)
    }

    pub fn requires_revision(&self) -> bool {
        self.ok == Some(false) && is_revision_code(&self.code)
    }

    /// Numeric confidence reported by the Eye, when present.
    pub fn confidence(&self) -> Option<f64> {
        self.data.get("confidence").and_then(Value::as_f64)
    }
}

/// The consolidated verdict returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverseerResponse {
    pub ok: bool,
    pub code: String,
    pub md: String,
    pub data: Value,
    pub next_action: String,
}

/// Event types carried on the pipeline bus. Custom domain events pass
/// through as free-form strings.
pub mod event_types {
    pub const EYE_UPDATE: &str = "eye_update";
    pub const ORCHESTRATION_PROGRESS: &str = "orchestration_progress";
    pub const SETTINGS_UPDATE: &str = "settings_update";
    pub const USER_INPUT: &str = "user_input";
}

/// A timestamped record on the pipeline bus. `seq` is assigned by the
/// topic at publish time and is strictly monotonic per session. `dropped`
/// appears on the first event delivered after a slow subscriber lost
/// events, carrying how many were shed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eye: Option<String>,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped: Option<u64>,
}

impl PipelineEvent {
    pub fn new(event_type: &str, session_id: &str, eye: Option<&str>, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            session_id: session_id.to_string(),
            seq: 0,
            ts: Utc::now(),
            eye: eye.map(str::to_string),
            data,
            dropped: None,
        }
    }

    pub fn eye_update(session_id: &str, result: &EyeResult) -> Self {
        Self::new(
            event_types::EYE_UPDATE,
            session_id,
            Some(&result.eye),
            serde_json::to_value(result).unwrap_or(Value::Null),
        )
    }

    pub fn progress(
        session_id: &str,
        stage: &str,
        current_stage: usize,
        total_stages: usize,
        progress: f64,
    ) -> Self {
        Self::new(
            event_types::ORCHESTRATION_PROGRESS,
            session_id,
            None,
            serde_json::json!({
                "stage": stage,
                "current_stage": current_stage,
                "total_stages": total_stages,
                "progress": progress,
            }),
        )
    }

    pub fn aborted(session_id: &str, stage: &str) -> Self {
        Self::new(
            event_types::ORCHESTRATION_PROGRESS,
            session_id,
            None,
            serde_json::json!({
                "stage": stage,
                "aborted": true,
            }),
        )
    }
}
