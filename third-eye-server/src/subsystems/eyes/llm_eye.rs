//! Persona-driven LLM Eyes.
//!
//! Jogan, Rinnegan, Mangekyo, Tenseigan, and Byakugan share one
//! implementation: a persona prompt, the work kinds they accept, and the
//! outcome codes they emit. The provider is asked for strict JSON and its
//! verdict is mapped onto the Eye result contract.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use third_eye_core::envelope::WorkEnvelope;
use third_eye_core::provider::{ChatMessage, ProviderClient};
use third_eye_core::response::EyeResult;

use super::{Eye, EyeContext, EyeDescriptor, EyeFailure, EyeHealth};
use crate::metrics::Metrics;

/// The verdict shape the persona prompt demands from the provider.
#[derive(Debug, Deserialize)]
struct Verdict {
    approved: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

pub struct LlmEye {
    name: String,
    version: String,
    description: String,
    accepts: Vec<String>,
    persona: String,
    ok_code: &'static str,
    fail_code: &'static str,
    provider: Arc<ProviderClient>,
    metrics: Arc<Metrics>,
    call_timeout: Duration,
}

impl LlmEye {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        description: &str,
        accepts: &[&str],
        persona: &str,
        ok_code: &'static str,
        fail_code: &'static str,
        provider: Arc<ProviderClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let call_timeout = provider.default_timeout();
        Self {
            name: name.to_string(),
            version: "2.0.0".to_string(),
            description: description.to_string(),
            accepts: accepts.iter().map(|s| s.to_string()).collect(),
            persona: persona.to_string(),
            ok_code,
            fail_code,
            provider,
            metrics,
            call_timeout,
        }
    }

    fn build_messages(&self, context: &EyeContext, envelope: &WorkEnvelope) -> Vec<ChatMessage> {
        let system = format!(
            "{}\n\nRespond with strict JSON only: {{\"approved\": bool, \
             \"summary\": string, \"confidence\": number in [0,1], \
             \"issues\": [string], \"recommendations\": [string]}}.",
            self.persona
        );

        let prior: Vec<serde_json::Value> = context
            .prior_results
            .iter()
            .map(|r| json!({"eye": r.eye, "ok": r.ok, "code": r.code}))
            .collect();

        let user = json!({
            "intent": envelope.payload.intent,
            "work": envelope.payload.work,
            "context_info": envelope.payload.context_info,
            "reasoning_md": envelope.reasoning_md,
            "lang": context.session.lang,
            "prior_results": prior,
        });

        vec![
            ChatMessage::system(system),
            ChatMessage::user(user.to_string()),
        ]
    }
}

#[async_trait]
impl Eye for LlmEye {
    fn describe(&self) -> EyeDescriptor {
        EyeDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            accepts: self.accepts.clone(),
            returns_clarifications: false,
        }
    }

    async fn invoke(
        &self,
        context: &EyeContext,
        envelope: &WorkEnvelope,
    ) -> Result<EyeResult, EyeFailure> {
        let messages = self.build_messages(context, envelope);
        let started = Instant::now();
        let outcome = self.provider.chat(&messages, true, self.call_timeout).await;
        match &outcome {
            Ok(completion) => self.metrics.record_provider_call(
                &self.name,
                started.elapsed(),
                true,
                completion.input_tokens,
                completion.output_tokens,
            ),
            Err(_) => self
                .metrics
                .record_provider_call(&self.name, started.elapsed(), false, 0, 0),
        }
        let completion = outcome.map_err(EyeFailure::Provider)?;

        let verdict: Verdict = serde_json::from_str(&completion.content).map_err(|e| {
            EyeFailure::Internal(format!("eye '{}' returned unparseable verdict: {}", self.name, e))
        })?;

        let data = json!({
            "confidence": verdict.confidence.unwrap_or(if verdict.approved { 0.9 } else { 0.3 }),
            "issues": verdict.issues,
            "recommendations": verdict.recommendations,
        });

        let md = if verdict.summary.is_empty() {
            format!("### {} verdict\napproved: {}", self.name, verdict.approved)
        } else {
            verdict.summary.clone()
        };

        Ok(if verdict.approved {
            EyeResult::passed(&self.name, self.ok_code, md, data)
        } else {
            EyeResult::failed(&self.name, self.fail_code, md, data)
        })
    }

    async fn health(&self) -> EyeHealth {
        let healthy = self.provider.health().await;
        EyeHealth {
            healthy,
            detail: (!healthy).then(|| "provider unreachable".to_string()),
        }
    }
}
