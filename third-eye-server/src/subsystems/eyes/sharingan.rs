//! Sharingan: the ambiguity radar.
//!
//! First Eye in most pipelines and the fallback when routing returns an
//! empty list. Scores the intent deterministically; above the per-session
//! threshold it stops the pipeline with clarification questions instead of
//! letting vague work flow into expensive validators.

use async_trait::async_trait;
use serde_json::json;
use third_eye_core::envelope::WorkEnvelope;
use third_eye_core::response::{codes, EyeResult};

use super::{Eye, EyeContext, EyeDescriptor, EyeFailure};

pub const EYE_NAME: &str = "sharingan";
const VERSION: &str = "2.1.0";

/// score * multiplier, clamped, decides how many questions to ask.
const QUESTION_MULTIPLIER: f64 = 4.0;
const QUESTION_MIN: usize = 1;
const QUESTION_MAX: usize = 8;

const VAGUE_TERMS: [&str; 10] = [
    "better", "improve", "nicer", "cleaner", "faster", "something", "stuff", "somehow", "maybe",
    "etc",
];

const QUESTION_BANK: [(&str, &str); 8] = [
    (
        "Which component, file, or endpoint should change?",
        "The request names no concrete target.",
    ),
    (
        "What does success look like, and how will it be measured?",
        "No acceptance criteria were given.",
    ),
    (
        "Are there constraints (performance, compatibility, style) the work must respect?",
        "Constraints change which solutions are acceptable.",
    ),
    (
        "Which language, framework, or runtime does this target?",
        "The environment was not stated.",
    ),
    (
        "Should existing behavior be preserved, or is breaking change acceptable?",
        "The blast radius is unclear.",
    ),
    (
        "Is there prior art in the project this should follow?",
        "Consistency with existing patterns matters.",
    ),
    (
        "What inputs and edge cases must the result handle?",
        "The input space was not described.",
    ),
    (
        "Who consumes the output, and in what format?",
        "The audience shapes the deliverable.",
    ),
];

pub struct Sharingan;

impl Sharingan {
    /// Heuristic ambiguity score in [0, 1]. Pure, so it is directly
    /// testable without the registry.
    pub fn ambiguity_score(envelope: &WorkEnvelope) -> f64 {
        let intent = envelope.payload.intent.trim();
        let words: Vec<&str> = intent.split_whitespace().collect();
        let lower = intent.to_lowercase();

        let mut score: f64 = 0.1;
        if words.len() < 4 {
            score += 0.3;
        }
        if VAGUE_TERMS.iter().any(|term| lower.contains(term)) {
            score += 0.25;
        }
        // No concrete anchor: neither a number, a path-like token, nor a
        // capitalized identifier in the middle of the sentence.
        let has_anchor = words.iter().skip(1).any(|w| {
            w.chars().any(|c| c.is_ascii_digit())
                || w.contains('/')
                || w.contains('.')
                || w.chars().next().is_some_and(|c| c.is_uppercase())
        });
        if !has_anchor {
            score += 0.2;
        }
        if envelope.payload.work.is_empty() {
            score += 0.1;
        }
        if envelope.payload.context_info.is_empty() {
            score += 0.15;
        }
        // Answered clarifications resolve ambiguity the intent alone
        // cannot express.
        let answered = envelope
            .payload
            .context_info
            .keys()
            .filter(|k| k.starts_with("clarification:"))
            .count();
        score -= 0.5 * answered.min(2) as f64;
        score.clamp(0.0, 1.0)
    }

    fn question_count(score: f64) -> usize {
        let target = (score * QUESTION_MULTIPLIER).ceil() as usize;
        target.clamp(QUESTION_MIN, QUESTION_MAX)
    }
}

#[async_trait]
impl Eye for Sharingan {
    fn describe(&self) -> EyeDescriptor {
        EyeDescriptor {
            name: EYE_NAME.to_string(),
            version: VERSION.to_string(),
            description: "Scores prompt ambiguity and gathers clarifying questions".to_string(),
            accepts: vec![],
            returns_clarifications: true,
        }
    }

    async fn invoke(
        &self,
        context: &EyeContext,
        envelope: &WorkEnvelope,
    ) -> Result<EyeResult, EyeFailure> {
        let score = Self::ambiguity_score(envelope);

        if score <= context.ambiguity_threshold {
            return Ok(EyeResult::passed(
                EYE_NAME,
                codes::OK_NO_CLARIFICATION_NEEDED,
                "### Prompt is actionable\nNo clarification needed; proceed to validation.",
                json!({
                    "ambiguity_score": score,
                    "confidence": 1.0 - score,
                }),
            ));
        }

        let count = Self::question_count(score);
        let clarifications: Vec<serde_json::Value> = QUESTION_BANK
            .iter()
            .take(count)
            .map(|(question, ctx)| json!({"question": question, "context": ctx}))
            .collect();

        let bullets: Vec<String> = clarifications
            .iter()
            .filter_map(|c| c["question"].as_str().map(|q| format!("- {}", q)))
            .collect();

        Ok(EyeResult::failed(
            EYE_NAME,
            codes::E_NEEDS_CLARIFICATION,
            format!(
                "### Clarification required\nAmbiguity score {:.2} exceeds the {:.2} threshold. Answer before resubmitting:\n{}",
                score,
                context.ambiguity_threshold,
                bullets.join("\n")
            ),
            json!({
                "ambiguity_score": score,
                "clarifications": clarifications,
                "confidence": 1.0 - score,
            }),
        ))
    }
}
