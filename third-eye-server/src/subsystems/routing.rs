//! The routing decision: which Eyes run, in what order.
//!
//! The branching space is open-ended, so the choice is delegated to the
//! provider with a strict JSON contract; deterministic fallbacks cover
//! the failure modes. Decisions are never cached across requests because
//! they depend on the payload.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use third_eye_core::envelope::WorkEnvelope;
use third_eye_core::provider::{ChatMessage, ProviderClient, ProviderError};

use super::eyes::{EyeDescriptor, SHARINGAN_EYE};
use crate::metrics::Metrics;

pub const ROUTING_TOOL: &str = "routing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub eyes: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    eyes_needed: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Ask the provider for an ordered Eye list. Fails with the classified
/// provider error when no decision can be produced within `deadline`;
/// the caller maps that to `E_LLM_ERROR`.
pub async fn decide(
    provider: &ProviderClient,
    available: &[EyeDescriptor],
    envelope: &WorkEnvelope,
    deadline: Duration,
    metrics: &Metrics,
) -> Result<RoutingDecision, ProviderError> {
    let catalog: Vec<serde_json::Value> = available
        .iter()
        .map(|d| {
            json!({
                "name": d.name,
                "description": d.description,
                "accepts": d.accepts,
            })
        })
        .collect();

    let system = "You route validation requests through a pipeline of \
                  specialized validators (\"eyes\"). Given the intent and the \
                  kinds of work submitted, pick the validators that apply, in \
                  execution order. Ambiguity screening comes first when the \
                  intent is vague. Respond with strict JSON only: \
                  {\"eyes_needed\": [string], \"reasoning\": string}. Use only \
                  names from the catalog.";

    let work_kinds: Vec<&String> = envelope.payload.work.keys().collect();
    let user = json!({
        "intent": envelope.payload.intent,
        "work_kinds": work_kinds,
        "context_info": envelope.payload.context_info,
        "catalog": catalog,
    });

    let started = Instant::now();
    let outcome = provider
        .chat(
            &[ChatMessage::system(system), ChatMessage::user(user.to_string())],
            true,
            deadline,
        )
        .await;
    match &outcome {
        Ok(completion) => metrics.record_provider_call(
            ROUTING_TOOL,
            started.elapsed(),
            true,
            completion.input_tokens,
            completion.output_tokens,
        ),
        Err(_) => metrics.record_provider_call(ROUTING_TOOL, started.elapsed(), false, 0, 0),
    }
    let completion = outcome?;

    let known: Vec<String> = available.iter().map(|d| d.name.clone()).collect();
    Ok(resolve(
        &completion.content,
        &known,
        !envelope.payload.work.is_empty(),
    ))
}

/// Pure resolution step: parse, dedup preserving first occurrence, drop
/// unknown names. An empty (or unusable) decision falls back to the
/// ambiguity radar only when the envelope actually carries work; with
/// nothing to validate, an empty decision stands and the Overseer runs
/// no Eyes at all.
pub fn resolve(raw: &str, known: &[String], has_work: bool) -> RoutingDecision {
    let parsed: RawDecision = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("routing decision unparseable, treating as empty: {}", e);
            RawDecision {
                eyes_needed: Vec::new(),
                reasoning: String::new(),
            }
        }
    };

    let mut eyes = Vec::new();
    for name in parsed.eyes_needed {
        if !known.contains(&name) {
            tracing::warn!("routing requested unknown eye '{}', dropping", name);
            continue;
        }
        if !eyes.contains(&name) {
            eyes.push(name);
        }
    }

    if eyes.is_empty() && has_work {
        eyes.push(SHARINGAN_EYE.to_string());
    }

    RoutingDecision {
        eyes,
        reasoning: parsed.reasoning,
    }
}
