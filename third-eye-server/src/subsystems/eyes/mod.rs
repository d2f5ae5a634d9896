//! Eye registry: capability contracts and dispatch.
//!
//! An Eye is any value implementing `describe` / `invoke` / `health`.
//! Adding a validator is registering a new implementation; nothing else
//! changes. The registry wraps every invocation with the per-Eye timeout
//! and maps failures onto the unified taxonomy. Cancellation propagates
//! from the caller: dropping the dispatch future drops the in-flight
//! invocation with it.

mod llm_eye;
mod sharingan;

pub use llm_eye::LlmEye;
pub use sharingan::{Sharingan, EYE_NAME as SHARINGAN_EYE};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use third_eye_core::envelope::WorkEnvelope;
use third_eye_core::models::Session;
use third_eye_core::provider::ProviderError;
use third_eye_core::response::EyeResult;

/// Static capability record returned by `describe`.
#[derive(Debug, Clone, Serialize)]
pub struct EyeDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Work kinds this Eye knows how to judge; empty means any.
    pub accepts: Vec<String>,
    pub returns_clarifications: bool,
}

/// Shared context handed to every invocation. Later Eyes see earlier
/// Eyes' results here; that is why the pipeline runs sequentially.
#[derive(Debug, Clone)]
pub struct EyeContext {
    pub session: Session,
    pub prior_results: Vec<EyeResult>,
    pub ambiguity_threshold: f64,
}

/// Classified invocation failure. Provider timeouts and upstream 5xx are
/// the retryable classes; everything else terminates the pipeline.
#[derive(Debug)]
pub enum EyeFailure {
    Provider(ProviderError),
    Timeout,
    Internal(String),
}

impl EyeFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Provider(e) => e.is_retryable(),
            Self::Internal(_) => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Provider(e) => e.to_string(),
            Self::Timeout => "eye invocation timed out".to_string(),
            Self::Internal(msg) => msg.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EyeHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EyeHealth {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }
}

#[async_trait]
pub trait Eye: Send + Sync {
    fn describe(&self) -> EyeDescriptor;

    async fn invoke(
        &self,
        context: &EyeContext,
        envelope: &WorkEnvelope,
    ) -> Result<EyeResult, EyeFailure>;

    /// Cheap liveness probe; the registry caches the answer for 30 s.
    async fn health(&self) -> EyeHealth {
        EyeHealth::ok()
    }
}

pub struct EyeRegistry {
    eyes: HashMap<String, Arc<dyn Eye>>,
    ordered_names: Vec<String>,
    health_cache: Mutex<HashMap<String, (Instant, EyeHealth)>>,
    health_cache_ttl: Duration,
    eye_timeout: Duration,
}

impl EyeRegistry {
    pub fn new(eye_timeout: Duration) -> Self {
        Self {
            eyes: HashMap::new(),
            ordered_names: Vec::new(),
            health_cache: Mutex::new(HashMap::new()),
            health_cache_ttl: Duration::from_secs(30),
            eye_timeout,
        }
    }

    pub fn register(&mut self, eye: Arc<dyn Eye>) {
        let name = eye.describe().name;
        if self.eyes.insert(name.clone(), eye).is_some() {
            tracing::warn!("eye '{}' already registered, overwriting", name);
        } else {
            self.ordered_names.push(name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.eyes.contains_key(name)
    }

    /// Registration order, which is also the canonical pipeline order.
    pub fn names(&self) -> Vec<String> {
        self.ordered_names.clone()
    }

    pub fn describe(&self, name: &str) -> Option<EyeDescriptor> {
        self.eyes.get(name).map(|eye| eye.describe())
    }

    pub fn descriptors(&self) -> Vec<EyeDescriptor> {
        self.ordered_names
            .iter()
            .filter_map(|name| self.describe(name))
            .collect()
    }

    /// Invoke an Eye under the per-Eye timeout. Unknown names are an
    /// internal failure; the Overseer filters them out before dispatch.
    pub async fn dispatch(
        &self,
        name: &str,
        context: &EyeContext,
        envelope: &WorkEnvelope,
    ) -> Result<EyeResult, EyeFailure> {
        let eye = self
            .eyes
            .get(name)
            .ok_or_else(|| EyeFailure::Internal(format!("unknown eye: {}", name)))?;

        match tokio::time::timeout(self.eye_timeout, eye.invoke(context, envelope)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("eye '{}' exceeded its {:?} timeout", name, self.eye_timeout);
                Err(EyeFailure::Timeout)
            }
        }
    }

    /// Health with a 30 s per-Eye cache so probe fan-in stays cheap.
    pub async fn health(&self, name: &str) -> Option<EyeHealth> {
        {
            let cache = self.health_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((checked_at, health)) = cache.get(name) {
                if checked_at.elapsed() < self.health_cache_ttl {
                    return Some(health.clone());
                }
            }
        }
        let eye = self.eyes.get(name)?;
        let health = eye.health().await;
        let mut cache = self.health_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(name.to_string(), (Instant::now(), health.clone()));
        Some(health)
    }
}

/// Assemble the shipping validator set. Sharingan is deterministic and
/// doubles as the routing fallback; the rest are persona-driven LLM Eyes
/// whose provider calls feed the per-tool metrics.
pub fn build_registry(
    provider: &Arc<third_eye_core::provider::ProviderClient>,
    metrics: &Arc<crate::metrics::Metrics>,
    eye_timeout: Duration,
) -> EyeRegistry {
    use third_eye_core::response::codes;

    let mut registry = EyeRegistry::new(eye_timeout);
    registry.register(Arc::new(Sharingan));
    registry.register(Arc::new(LlmEye::new(
        "jogan",
        "Confirms the stated intent matches the submitted work and budget",
        &[],
        "You are Jogan, the intent gate. Judge whether the submitted work \
         package actually serves the stated intent and fits the declared \
         budget. Reject scope creep.",
        codes::OK_INTENT_CONFIRMED,
        codes::E_INTENT_UNCONFIRMED,
        provider.clone(),
        metrics.clone(),
    )));
    registry.register(Arc::new(LlmEye::new(
        "rinnegan",
        "Reviews implementation plans for completeness and ordering",
        &["plan", "requirements"],
        "You are Rinnegan, the plan reviewer. Judge whether the plan covers \
         the intent end to end: steps, ordering, rollback, and risks.",
        codes::OK_PLAN_APPROVED,
        codes::E_PLAN_INCOMPLETE,
        provider.clone(),
        metrics.clone(),
    )));
    registry.register(Arc::new(LlmEye::new(
        "mangekyo",
        "Reviews code changes: scaffold, implementation, tests, docs",
        &["code", "tests", "docs"],
        "You are Mangekyo, the code gate. Review the submitted code for \
         correctness, test coverage, and documentation, phase by phase.",
        codes::OK_CODE_APPROVED,
        codes::E_CODE_ISSUES,
        provider.clone(),
        metrics.clone(),
    )));
    registry.register(Arc::new(LlmEye::new(
        "tenseigan",
        "Validates factual claims in drafts against provided evidence",
        &["draft", "docs"],
        "You are Tenseigan, the evidence gate. Every factual claim in the \
         draft needs support in the provided context; flag the unsupported \
         ones.",
        codes::OK_TEXT_VALIDATED,
        codes::E_UNSUPPORTED_CLAIMS,
        provider.clone(),
        metrics.clone(),
    )));
    registry.register(Arc::new(LlmEye::new(
        "byakugan",
        "Checks drafts for contradictions with session history",
        &["draft"],
        "You are Byakugan, the consistency gate. Compare the draft against \
         the prior results and context for contradictions.",
        codes::OK_CONSISTENT,
        codes::E_CONTRADICTION_DETECTED,
        provider.clone(),
        metrics.clone(),
    )));
    registry
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Programmable Eye for pipeline tests. Counts invocations so tests
    /// can assert short-circuit behavior.
    pub struct StubEye {
        pub name: String,
        pub result: Result<EyeResult, String>,
        pub invocations: AtomicUsize,
        pub delay: Option<Duration>,
    }

    impl StubEye {
        pub fn returning(name: &str, result: EyeResult) -> Self {
            Self {
                name: name.to_string(),
                result: Ok(result),
                invocations: AtomicUsize::new(0),
                delay: None,
            }
        }

        pub fn count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Eye for StubEye {
        fn describe(&self) -> EyeDescriptor {
            EyeDescriptor {
                name: self.name.clone(),
                version: "0.0.0".to_string(),
                description: "stub".to_string(),
                accepts: vec![],
                returns_clarifications: false,
            }
        }

        async fn invoke(
            &self,
            _context: &EyeContext,
            _envelope: &WorkEnvelope,
        ) -> Result<EyeResult, EyeFailure> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result
                .clone()
                .map_err(EyeFailure::Internal)
        }
    }
}
