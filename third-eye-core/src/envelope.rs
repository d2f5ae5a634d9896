//! Work envelope: the payload submitted to the orchestrator.
//!
//! The MCP bridge wraps tool calls as `{arguments: {...}, signal, _meta,
//! requestId, progressToken}`. `WorkEnvelope::from_wire` unwraps `arguments`,
//! strips the reserved wrapper keys, and decodes the remainder into a typed
//! envelope. Validation is mode-dependent: strict submissions must carry a
//! full work package, relaxed submissions only need an intent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wrapper keys owned by the bridge transport, never forwarded.
const RESERVED_WRAPPER_KEYS: [&str; 4] = ["signal", "_meta", "requestId", "progressToken"];

const STRICT_MIN_INTENT: usize = 5;
const STRICT_MIN_REASONING: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub budget_tokens: i64,
    #[serde(default)]
    pub tenant: Option<String>,
}

fn default_lang() -> String {
    "auto".to_string()
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            session_id: None,
            user_id: None,
            lang: default_lang(),
            budget_tokens: 0,
            tenant: None,
        }
    }
}

/// The work package inside an envelope. `work` kinds are an open set:
/// code, plan, draft, requirements, tests, docs, and anything else the
/// host sends pass through unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkPayload {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub work: BTreeMap<String, String>,
    #[serde(default)]
    pub context_info: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkEnvelope {
    #[serde(default)]
    pub context: RequestContext,
    #[serde(default)]
    pub payload: WorkPayload,
    #[serde(default)]
    pub reasoning_md: String,
    #[serde(default = "default_strict")]
    pub strict_mode: bool,
}

fn default_strict() -> bool {
    true
}

/// One failed validation check. `field` names the offending field so the
/// caller can fix exactly that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub hint: String,
}

impl ValidationIssue {
    fn new(field: &str, message: &str, hint: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
            hint: hint.to_string(),
        }
    }
}

impl WorkEnvelope {
    /// Decode an incoming JSON body, unwrapping the MCP bridge envelope when
    /// present. A missing `payload` becomes an empty one; `context` is left
    /// absent for the front-end to reconstruct from the connection binding.
    pub fn from_wire(mut body: Value) -> Result<Self, ValidationIssue> {
        let wrapped = match body.as_object_mut() {
            Some(map) => map.remove("arguments"),
            None => None,
        };
        if let Some(arguments) = wrapped {
            if !arguments.is_object() {
                return Err(ValidationIssue::new(
                    "arguments",
                    "arguments must be an object",
                    "send {\"arguments\": {\"context\": ..., \"payload\": ...}}",
                ));
            }
            body = arguments;
        }
        if let Some(map) = body.as_object_mut() {
            for key in RESERVED_WRAPPER_KEYS {
                map.remove(key);
            }
        }
        serde_json::from_value(body).map_err(|e| {
            ValidationIssue::new(
                "envelope",
                &format!("malformed envelope: {}", e),
                "check field types against the request schema",
            )
        })
    }

    /// Mode-dependent payload contract. Returns every failed check, not just
    /// the first, so a host can repair the submission in one round trip.
    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        let intent_len = self.payload.intent.trim().chars().count();

        if self.strict_mode {
            if intent_len < STRICT_MIN_INTENT {
                issues.push(ValidationIssue::new(
                    "intent",
                    "intent is required (minimum 5 characters)",
                    "describe the validation request in a full sentence",
                ));
            }
            if self.payload.work.is_empty() {
                issues.push(ValidationIssue::new(
                    "work",
                    "work is required and must contain at least one entry",
                    "submit the artifact under its kind, e.g. {\"code\": \"...\"}",
                ));
            }
            if self.payload.context_info.is_empty() {
                issues.push(ValidationIssue::new(
                    "context_info",
                    "context_info is required and must contain at least one entry",
                    "include project metadata, e.g. {\"lang\": \"python\"}",
                ));
            }
            if self.reasoning_md.trim().chars().count() < STRICT_MIN_REASONING {
                issues.push(ValidationIssue::new(
                    "reasoning_md",
                    "reasoning_md is required (minimum 10 characters)",
                    "justify the submission, or set strict_mode=false for drafts",
                ));
            }
        } else if intent_len < 1 {
            issues.push(ValidationIssue::new(
                "intent",
                "intent is required (minimum 1 character in relaxed mode)",
                "state what should be validated",
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strict_envelope() -> WorkEnvelope {
        WorkEnvelope::from_wire(json!({
            "payload": {
                "intent": "Review my login endpoint",
                "work": {"code": "def login(): pass"},
                "context_info": {"lang": "python"},
            },
            "reasoning_md": "Security review before merge to main.",
            "strict_mode": true,
        }))
        .unwrap()
    }

    #[test]
    fn strict_envelope_passes_validation() {
        assert!(strict_envelope().validate().is_ok());
    }

    #[test]
    fn strict_mode_rejects_short_reasoning_naming_the_field() {
        let mut env = strict_envelope();
        env.reasoning_md = "short".to_string();
        let issues = env.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "reasoning_md");
    }

    #[test]
    fn strict_mode_collects_every_failed_check() {
        let env = WorkEnvelope::from_wire(json!({
            "payload": {"intent": "hi"},
            "strict_mode": true,
        }))
        .unwrap();
        let issues = env.validate().unwrap_err();
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, ["intent", "work", "context_info", "reasoning_md"]);
    }

    #[test]
    fn relaxed_mode_accepts_minimal_intent() {
        let env = WorkEnvelope::from_wire(json!({
            "payload": {"intent": "test"},
            "strict_mode": false,
        }))
        .unwrap();
        assert!(env.validate().is_ok());
    }

    #[test]
    fn relaxed_mode_still_requires_an_intent() {
        let env = WorkEnvelope::from_wire(json!({
            "payload": {},
            "strict_mode": false,
        }))
        .unwrap();
        let issues = env.validate().unwrap_err();
        assert_eq!(issues[0].field, "intent");
    }

    #[test]
    fn from_wire_unwraps_bridge_arguments_and_strips_reserved_keys() {
        let env = WorkEnvelope::from_wire(json!({
            "arguments": {
                "payload": {"intent": "validate the plan"},
                "reasoning_md": "because the plan is load-bearing",
                "signal": {"aborted": false},
                "_meta": {"trace": "t-1"},
                "requestId": 7,
                "progressToken": "p-1",
            }
        }))
        .unwrap();
        assert_eq!(env.payload.intent, "validate the plan");
        assert!(env.context.session_id.is_none());
    }

    #[test]
    fn from_wire_defaults_missing_payload_to_empty() {
        let env = WorkEnvelope::from_wire(json!({"strict_mode": false})).unwrap();
        assert!(env.payload.intent.is_empty());
        assert!(env.payload.work.is_empty());
    }

    #[test]
    fn unknown_work_kinds_pass_through() {
        let env = WorkEnvelope::from_wire(json!({
            "payload": {
                "intent": "check my migration",
                "work": {"sql_migration": "ALTER TABLE ..."},
                "context_info": {"db": "postgres"},
            },
            "reasoning_md": "schema change needs a second pair of eyes",
        }))
        .unwrap();
        assert!(env.validate().is_ok());
        assert!(env.payload.work.contains_key("sql_migration"));
    }
}
