//! The Overseer: turns a work envelope into an ordered sequence of Eye
//! invocations and one consolidated verdict.
//!
//! Eyes run sequentially, never in parallel: later Eyes read earlier
//! results as context, and the short-circuit policy stays a plain
//! `return`. Every stage transition publishes `orchestration_progress`,
//! every finished Eye publishes `eye_update`. A transport-class failure
//! is retried once with identical input; a second failure ends the
//! pipeline as a partial success with the prior results preserved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use third_eye_core::envelope::{ValidationIssue, WorkEnvelope};
use third_eye_core::models::Session;
use third_eye_core::provider::{ProviderClient, ProviderError};
use third_eye_core::response::{codes, EyeResult, OverseerResponse, PipelineEvent};
use third_eye_core::Persistence;

use super::bus::PipelineBus;
use super::eyes::{EyeContext, EyeFailure, EyeRegistry};
use super::routing;
use crate::metrics::Metrics;

pub const NEXT_SUBMIT_CLARIFICATIONS: &str = "submit_clarifications";
pub const NEXT_REVISE: &str = "revise_and_resubmit";

pub struct Overseer {
    registry: Arc<EyeRegistry>,
    provider: Arc<ProviderClient>,
    bus: Arc<PipelineBus>,
    persistence: Persistence,
    metrics: Arc<Metrics>,
    routing_timeout: Duration,
    overall_timeout: Duration,
    ambiguity_threshold: f64,
}

impl Overseer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<EyeRegistry>,
        provider: Arc<ProviderClient>,
        bus: Arc<PipelineBus>,
        persistence: Persistence,
        metrics: Arc<Metrics>,
        routing_timeout: Duration,
        overall_timeout: Duration,
        ambiguity_threshold: f64,
    ) -> Self {
        Self {
            registry,
            provider,
            bus,
            persistence,
            metrics,
            routing_timeout,
            overall_timeout,
            ambiguity_threshold,
        }
    }

    pub fn registry(&self) -> &EyeRegistry {
        &self.registry
    }

    /// Run the full pipeline for one envelope. The caller owns session
    /// touch and audit; this owns validation, routing, execution, and
    /// aggregation.
    pub async fn orchestrate(&self, session: &Session, envelope: &WorkEnvelope) -> OverseerResponse {
        Metrics::incr(&self.metrics.orchestrations_total);

        if let Err(issues) = envelope.validate() {
            return bad_payload_response(envelope.strict_mode, &issues);
        }

        let decision = match routing::decide(
            &self.provider,
            &self.registry.descriptors(),
            envelope,
            self.routing_timeout,
            &self.metrics,
        )
        .await
        {
            Ok(decision) => decision,
            Err(e) => {
                Metrics::incr(&self.metrics.provider_errors_total);
                tracing::error!(
                    "routing decision failed for session {}: {}",
                    session.id,
                    e
                );
                return self.llm_error_response(&e);
            }
        };

        // An empty decision means there is nothing to gate: no work was
        // submitted and routing saw no reason to force a clarity pass.
        if decision.eyes.is_empty() {
            tracing::info!("session {} needs no validation", session.id);
            return no_validation_response(&decision.reasoning);
        }

        tracing::info!(
            "session {} routed through {:?}",
            session.id,
            decision.eyes
        );

        let started = Instant::now();
        let total = decision.eyes.len();
        let mut results: Vec<EyeResult> = Vec::new();

        for (idx, eye_name) in decision.eyes.iter().enumerate() {
            if started.elapsed() >= self.overall_timeout {
                let stage = format!("eye_{}", eye_name);
                self.emit(PipelineEvent::aborted(&session.id, &stage)).await;
                Metrics::incr(&self.metrics.eye_failures_total);
                return self.failure_response(
                    &results,
                    eye_name,
                    "orchestration deadline exceeded",
                    true,
                    &decision.reasoning,
                );
            }

            let stage = format!("eye_{}", eye_name);
            self.emit(PipelineEvent::progress(
                &session.id,
                &stage,
                idx + 1,
                total,
                idx as f64 / total as f64,
            ))
            .await;

            let context = EyeContext {
                session: session.clone(),
                prior_results: results.clone(),
                ambiguity_threshold: self.ambiguity_threshold,
            };

            let outcome = match self.registry.dispatch(eye_name, &context, envelope).await {
                Err(failure) if failure.is_retryable() => {
                    tracing::warn!(
                        "eye '{}' failed ({}), retrying once",
                        eye_name,
                        failure.describe()
                    );
                    self.registry.dispatch(eye_name, &context, envelope).await
                }
                other => other,
            };

            let result = match outcome {
                Ok(result) => result,
                Err(failure) => {
                    Metrics::incr(&self.metrics.eye_failures_total);
                    if let EyeFailure::Provider(_) = &failure {
                        Metrics::incr(&self.metrics.provider_errors_total);
                    }
                    let synthetic = EyeResult::failed(
                        eye_name,
                        codes::E_ORCHESTRATION_FAILED,
                        format!("### {} failed\n{}", eye_name, failure.describe()),
                        json!({"error": failure.describe()}),
                    );
                    self.emit(PipelineEvent::eye_update(&session.id, &synthetic))
                        .await;
                    return self.failure_response(
                        &results,
                        eye_name,
                        &failure.describe(),
                        false,
                        &decision.reasoning,
                    );
                }
            };

            self.emit(PipelineEvent::eye_update(&session.id, &result)).await;

            if result.requires_clarification() {
                tracing::info!(
                    "session {} paused at '{}' for clarifications",
                    session.id,
                    eye_name
                );
                return clarification_response(&results, &result, &decision.reasoning);
            }
            if result.requires_revision() {
                return revision_response(&results, &result, &decision.reasoning);
            }

            results.push(result);
        }

        self.emit(PipelineEvent::progress(
            &session.id,
            "complete",
            total,
            total,
            1.0,
        ))
        .await;

        synthesis_response(&results, &decision.reasoning)
    }

    async fn emit(&self, event: PipelineEvent) {
        let session_id = event.session_id.clone();
        let stamped = self.bus.publish(&session_id, event);
        self.persistence.log_pipeline_event(&stamped).await;
    }

    fn llm_error_response(&self, error: &ProviderError) -> OverseerResponse {
        let fallback: Map<String, Value> = self
            .registry
            .names()
            .into_iter()
            .map(|name| (name.clone(), Value::String(format!("/eyes/{}", name))))
            .collect();

        OverseerResponse {
            ok: false,
            code: codes::E_LLM_ERROR.to_string(),
            md: format!(
                "### Routing unavailable\nThe provider could not produce a \
                 routing decision ({}).\n\nRecovery:\n- check provider \
                 credentials and status\n- retry after the provider \
                 recovers\n- or invoke Eyes directly via their endpoints",
                error
            ),
            data: json!({
                "error_type": error.kind(),
                "error": error.to_string(),
                "fallback_endpoints": fallback,
            }),
            next_action: "Check provider health, then retry or invoke eyes directly".to_string(),
        }
    }

    fn failure_response(
        &self,
        results: &[EyeResult],
        failed_eye: &str,
        error: &str,
        aborted: bool,
        reasoning: &str,
    ) -> OverseerResponse {
        OverseerResponse {
            ok: false,
            code: codes::E_ORCHESTRATION_FAILED.to_string(),
            md: format!(
                "### Orchestration failed at `{}`\n{}\n\nCompleted validations: {}",
                failed_eye,
                error,
                if results.is_empty() {
                    "none".to_string()
                } else {
                    results
                        .iter()
                        .map(|r| r.eye.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                }
            ),
            data: json!({
                "partial_results": validations_map(results),
                "completed_validations": results.iter().map(|r| r.eye.clone()).collect::<Vec<_>>(),
                "failed_eye": failed_eye,
                "error": error,
                "aborted": aborted,
                "routing_reasoning": reasoning,
            }),
            next_action: "Review partial results, fix the failing stage, then retry".to_string(),
        }
    }
}

fn bad_payload_response(strict_mode: bool, issues: &[ValidationIssue]) -> OverseerResponse {
    let bullets: Vec<String> = issues
        .iter()
        .map(|i| format!("- `{}`: {} ({})", i.field, i.message, i.hint))
        .collect();
    OverseerResponse {
        ok: false,
        code: codes::E_BAD_PAYLOAD_SCHEMA.to_string(),
        md: format!(
            "### Submission rejected\nValidation mode: {}\n\n{}",
            if strict_mode { "STRICT" } else { "RELAXED" },
            bullets.join("\n")
        ),
        data: json!({
            "validation_errors": issues,
            "enforcement_level": if strict_mode { "strict" } else { "relaxed" },
            "strict_mode": strict_mode,
        }),
        next_action: "Fix validation errors and resubmit the complete work package".to_string(),
    }
}

fn no_validation_response(reasoning: &str) -> OverseerResponse {
    OverseerResponse {
        ok: true,
        code: codes::OK_NO_VALIDATION_NEEDED.to_string(),
        md: "### No validation required\nThe request carries no work artifacts; \
             there is nothing to gate."
            .to_string(),
        data: json!({
            "validations": {},
            "eyes_used": [],
            "eyes_skipped": "all",
            "confidence": 1.0,
            "routing_reasoning": reasoning,
        }),
        next_action: "Proceed; resubmit with work artifacts when validation is wanted"
            .to_string(),
    }
}

fn clarification_response(
    results: &[EyeResult],
    clarifying: &EyeResult,
    reasoning: &str,
) -> OverseerResponse {
    OverseerResponse {
        ok: false,
        code: clarifying.code.clone(),
        md: clarifying.md.clone(),
        data: json!({
            "clarifications": clarifying.data.get("clarifications").cloned().unwrap_or(Value::Array(vec![])),
            "validations": validations_map(results),
            "awaiting_user_input": true,
            "routing_reasoning": reasoning,
        }),
        next_action: NEXT_SUBMIT_CLARIFICATIONS.to_string(),
    }
}

fn revision_response(
    results: &[EyeResult],
    rejecting: &EyeResult,
    reasoning: &str,
) -> OverseerResponse {
    OverseerResponse {
        ok: false,
        code: rejecting.code.clone(),
        md: rejecting.md.clone(),
        data: json!({
            "recommendations": rejecting.data.get("recommendations").cloned().unwrap_or(Value::Array(vec![])),
            "issues": rejecting.data.get("issues").cloned().unwrap_or(Value::Array(vec![])),
            "rejected_by": rejecting.eye,
            "validations": validations_map(results),
            "routing_reasoning": reasoning,
        }),
        next_action: NEXT_REVISE.to_string(),
    }
}

fn synthesis_response(results: &[EyeResult], reasoning: &str) -> OverseerResponse {
    let all_passed = results.iter().all(|r| r.ok == Some(true));
    let confidence = mean_confidence(results);
    let eyes_used: Vec<String> = results.iter().map(|r| r.eye.clone()).collect();

    OverseerResponse {
        ok: all_passed,
        code: if all_passed {
            codes::OK_ALL.to_string()
        } else {
            codes::E_PARTIAL_FAIL.to_string()
        },
        md: format!(
            "### Orchestration complete\n{} of {} validations passed (confidence {:.2}).",
            results.iter().filter(|r| r.ok == Some(true)).count(),
            results.len(),
            confidence
        ),
        data: json!({
            "validations": validations_map(results),
            "eyes_used": eyes_used,
            "confidence": confidence,
            "routing_reasoning": reasoning,
        }),
        next_action: if all_passed {
            "Validation complete; proceed with delivery".to_string()
        } else {
            "Address the failed validations and resubmit".to_string()
        },
    }
}

/// Mean of per-Eye confidences. Eyes that reported none contribute a
/// pass/fail prior instead, so one silent Eye cannot swing the scalar.
fn mean_confidence(results: &[EyeResult]) -> f64 {
    if results.is_empty() {
        return 1.0;
    }
    let sum: f64 = results
        .iter()
        .map(|r| {
            r.confidence()
                .unwrap_or(if r.ok == Some(true) { 0.9 } else { 0.3 })
        })
        .sum();
    (sum / results.len() as f64).clamp(0.0, 1.0)
}

fn validations_map(results: &[EyeResult]) -> Value {
    let mut map = Map::new();
    for result in results {
        map.insert(
            result.eye.clone(),
            serde_json::to_value(result).unwrap_or(Value::Null),
        );
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::eyes::test_support::StubEye;
    use crate::subsystems::eyes::{Eye, EyeDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use third_eye_core::config::ProviderConfig;
    use third_eye_core::response::event_types;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fails with a retryable error N times, then succeeds.
    struct FlakyEye {
        name: String,
        failures_left: AtomicUsize,
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl Eye for FlakyEye {
        fn describe(&self) -> EyeDescriptor {
            EyeDescriptor {
                name: self.name.clone(),
                version: "0.0.0".to_string(),
                description: "flaky".to_string(),
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
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(EyeFailure::Provider(ProviderError::Upstream {
                    status: 503,
                    message: "flaky".to_string(),
                }));
            }
            Ok(EyeResult::passed(
                &self.name,
                codes::OK_ALL,
                "recovered",
                json!({"confidence": 0.7}),
            ))
        }
    }

    async fn routing_server(eyes: &[&str]) -> MockServer {
        let server = MockServer::start().await;
        let decision = json!({"eyes_needed": eyes, "reasoning": "test route"});
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": decision.to_string()}}]
            })))
            .mount(&server)
            .await;
        server
    }

    fn provider_for(server_uri: &str) -> Arc<ProviderClient> {
        let config = ProviderConfig {
            base_url: server_uri.to_string(),
            timeout_seconds: 5,
            ..ProviderConfig::default()
        };
        Arc::new(ProviderClient::new(&config, Some("sk-test".to_string())).unwrap())
    }

    fn overseer_with(
        registry: EyeRegistry,
        provider: Arc<ProviderClient>,
        bus: Arc<PipelineBus>,
    ) -> Overseer {
        Overseer::new(
            Arc::new(registry),
            provider,
            bus,
            Persistence::disabled(),
            Arc::new(Metrics::new()),
            Duration::from_secs(5),
            Duration::from_secs(60),
            0.45,
        )
    }

    fn relaxed_envelope(intent: &str) -> WorkEnvelope {
        let mut envelope = WorkEnvelope::default();
        envelope.strict_mode = false;
        envelope.payload.intent = intent.to_string();
        envelope
            .payload
            .work
            .insert("code".to_string(), "fn main() {}".to_string());
        envelope
    }

    fn session() -> Session {
        Session::new("sess-overseer".to_string(), 60)
    }

    #[tokio::test]
    async fn invalid_envelope_is_rejected_before_routing() {
        // No provider mock mounted: validation must fail first.
        let server = MockServer::start().await;
        let bus = Arc::new(PipelineBus::new(256, 64));
        let mut envelope = relaxed_envelope("x");
        envelope.strict_mode = true;
        envelope.reasoning_md = "short".to_string();

        let overseer = overseer_with(
            EyeRegistry::new(Duration::from_secs(5)),
            provider_for(&server.uri()),
            bus,
        );
        let response = overseer.orchestrate(&session(), &envelope).await;
        assert!(!response.ok);
        assert_eq!(response.code, codes::E_BAD_PAYLOAD_SCHEMA);
        let fields: Vec<&str> = response.data["validation_errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["field"].as_str().unwrap())
            .collect();
        assert!(fields.contains(&"reasoning_md"));
    }

    #[tokio::test]
    async fn routing_failure_maps_to_llm_error_with_fallback_hints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut registry = EyeRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(StubEye::returning(
            "rinnegan",
            EyeResult::passed("rinnegan", codes::OK_PLAN_APPROVED, "", json!({})),
        )));
        let overseer = overseer_with(
            registry,
            provider_for(&server.uri()),
            Arc::new(PipelineBus::new(256, 64)),
        );

        let response = overseer
            .orchestrate(&session(), &relaxed_envelope("validate this plan"))
            .await;
        assert_eq!(response.code, codes::E_LLM_ERROR);
        assert_eq!(response.data["error_type"], "upstream_5xx");
        assert_eq!(
            response.data["fallback_endpoints"]["rinnegan"],
            "/eyes/rinnegan"
        );
    }

    #[tokio::test]
    async fn full_pipeline_aggregates_and_reports_mean_confidence() {
        let server = routing_server(&["jogan", "rinnegan"]).await;
        let bus = Arc::new(PipelineBus::new(256, 64));
        let mut sub = bus.subscribe("sess-overseer", None);

        let mut registry = EyeRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(StubEye::returning(
            "jogan",
            EyeResult::passed("jogan", codes::OK_INTENT_CONFIRMED, "", json!({"confidence": 0.8})),
        )));
        registry.register(Arc::new(StubEye::returning(
            "rinnegan",
            EyeResult::passed("rinnegan", codes::OK_PLAN_APPROVED, "", json!({"confidence": 0.6})),
        )));

        let overseer = overseer_with(registry, provider_for(&server.uri()), bus.clone());
        let response = overseer
            .orchestrate(&session(), &relaxed_envelope("review plan and intent"))
            .await;

        assert!(response.ok);
        assert_eq!(response.code, codes::OK_ALL);
        let confidence = response.data["confidence"].as_f64().unwrap();
        assert!((confidence - 0.7).abs() < 1e-9);
        assert_eq!(
            response.data["eyes_used"],
            json!(["jogan", "rinnegan"])
        );

        // Events: progress(jogan), eye_update(jogan), progress(rinnegan),
        // eye_update(rinnegan), progress(complete) — in seq order.
        let mut types = Vec::new();
        for _ in 0..5 {
            types.push(sub.recv().await.unwrap().event_type);
        }
        assert_eq!(
            types,
            vec![
                event_types::ORCHESTRATION_PROGRESS,
                event_types::EYE_UPDATE,
                event_types::ORCHESTRATION_PROGRESS,
                event_types::EYE_UPDATE,
                event_types::ORCHESTRATION_PROGRESS,
            ]
        );
    }

    #[tokio::test]
    async fn empty_route_with_no_work_runs_no_eyes() {
        let server = routing_server(&[]).await;
        let bus = Arc::new(PipelineBus::new(256, 64));
        let mut sub = bus.subscribe("sess-overseer", None);

        let sharingan = Arc::new(StubEye::returning(
            "sharingan",
            EyeResult::passed("sharingan", codes::OK_NO_CLARIFICATION_NEEDED, "", json!({})),
        ));
        let mut registry = EyeRegistry::new(Duration::from_secs(5));
        registry.register(sharingan.clone());

        let overseer = overseer_with(registry, provider_for(&server.uri()), bus.clone());
        let mut envelope = WorkEnvelope::default();
        envelope.strict_mode = false;
        envelope.payload.intent = "confirming the request contract only".to_string();

        let response = overseer.orchestrate(&session(), &envelope).await;
        assert!(response.ok);
        assert_eq!(response.code, codes::OK_NO_VALIDATION_NEEDED);
        assert_eq!(response.data["eyes_used"], json!([]));
        assert_eq!(sharingan.count(), 0, "no eye may run without work");

        // Nothing was published for this non-pipeline.
        let next = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(next.is_err(), "no events expected");
    }

    #[tokio::test]
    async fn clarification_short_circuit_skips_later_eyes() {
        let server = routing_server(&["sharingan", "rinnegan"]).await;
        let bus = Arc::new(PipelineBus::new(256, 64));
        let mut sub = bus.subscribe("sess-overseer", None);

        let clarify = EyeResult::failed(
            "sharingan",
            codes::E_NEEDS_CLARIFICATION,
            "which component?",
            json!({"clarifications": [{"question": "Which component?"}]}),
        );
        let later = Arc::new(StubEye::returning(
            "rinnegan",
            EyeResult::passed("rinnegan", codes::OK_PLAN_APPROVED, "", json!({})),
        ));

        let mut registry = EyeRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(StubEye::returning("sharingan", clarify)));
        registry.register(later.clone());

        let overseer = overseer_with(registry, provider_for(&server.uri()), bus.clone());
        let response = overseer
            .orchestrate(&session(), &relaxed_envelope("make it better"))
            .await;

        assert!(!response.ok);
        assert_eq!(response.next_action, NEXT_SUBMIT_CLARIFICATIONS);
        assert_eq!(
            response.data["clarifications"][0]["question"],
            "Which component?"
        );
        assert_eq!(later.count(), 0, "later eye must not run");

        // Exactly one progress event and one eye_update on the bus.
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.event_type, event_types::ORCHESTRATION_PROGRESS);
        assert_eq!(second.event_type, event_types::EYE_UPDATE);
        drop(overseer);
        bus.close("sess-overseer");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn revision_short_circuit_surfaces_recommendations() {
        let server = routing_server(&["rinnegan", "mangekyo"]).await;
        let later = Arc::new(StubEye::returning(
            "mangekyo",
            EyeResult::passed("mangekyo", codes::OK_CODE_APPROVED, "", json!({})),
        ));

        let mut registry = EyeRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(StubEye::returning(
            "rinnegan",
            EyeResult::failed(
                "rinnegan",
                codes::E_PLAN_INCOMPLETE,
                "plan gaps",
                json!({"recommendations": ["add rollback"]}),
            ),
        )));
        registry.register(later.clone());

        let overseer = overseer_with(
            registry,
            provider_for(&server.uri()),
            Arc::new(PipelineBus::new(256, 64)),
        );
        let response = overseer
            .orchestrate(&session(), &relaxed_envelope("review my plan"))
            .await;

        assert_eq!(response.next_action, NEXT_REVISE);
        assert_eq!(response.code, codes::E_PLAN_INCOMPLETE);
        assert_eq!(response.data["recommendations"][0], "add rollback");
        assert_eq!(later.count(), 0);
    }

    #[tokio::test]
    async fn transient_eye_failure_is_retried_once_and_recovers() {
        let server = routing_server(&["flaky"]).await;
        let flaky = Arc::new(FlakyEye {
            name: "flaky".to_string(),
            failures_left: AtomicUsize::new(1),
            invocations: AtomicUsize::new(0),
        });
        let mut registry = EyeRegistry::new(Duration::from_secs(5));
        registry.register(flaky.clone());

        let overseer = overseer_with(
            registry,
            provider_for(&server.uri()),
            Arc::new(PipelineBus::new(256, 64)),
        );
        let response = overseer
            .orchestrate(&session(), &relaxed_envelope("try the flaky gate"))
            .await;

        assert!(response.ok);
        assert_eq!(flaky.invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_failure_preserves_partial_results() {
        let server = routing_server(&["jogan", "flaky"]).await;
        let flaky = Arc::new(FlakyEye {
            name: "flaky".to_string(),
            failures_left: AtomicUsize::new(usize::MAX),
            invocations: AtomicUsize::new(0),
        });
        let mut registry = EyeRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(StubEye::returning(
            "jogan",
            EyeResult::passed("jogan", codes::OK_INTENT_CONFIRMED, "", json!({})),
        )));
        registry.register(flaky.clone());

        let overseer = overseer_with(
            registry,
            provider_for(&server.uri()),
            Arc::new(PipelineBus::new(256, 64)),
        );
        let response = overseer
            .orchestrate(&session(), &relaxed_envelope("intent then flaky"))
            .await;

        assert!(!response.ok);
        assert_eq!(response.code, codes::E_ORCHESTRATION_FAILED);
        assert_eq!(response.data["completed_validations"], json!(["jogan"]));
        assert!(response.data["partial_results"]["jogan"].is_object());
        assert_eq!(response.data["failed_eye"], "flaky");
        assert_eq!(flaky.invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mean_confidence_mixes_reported_and_prior() {
        let results = vec![
            EyeResult::passed("a", codes::OK_ALL, "", json!({"confidence": 0.5})),
            EyeResult::passed("b", codes::OK_ALL, "", json!({})),
        ];
        assert!((mean_confidence(&results) - 0.7).abs() < 1e-9);
        assert_eq!(mean_confidence(&[]), 1.0);
    }
}
