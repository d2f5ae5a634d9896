//! Third Eye HTTP surface.
//!
//! Thin axum handlers over an explicit application state built once at
//! startup (tests build their own). Auth, CSRF, and quota admission run
//! here, before the Overseer is entered; the error taxonomy maps onto
//! HTTP statuses at this boundary and every outcome lands in the audit
//! log.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use third_eye_core::csrf::{CsrfSigner, CSRF_COOKIE_NAME, CSRF_TOKEN_HEADER};
use third_eye_core::envelope::WorkEnvelope;
use third_eye_core::keys;
use third_eye_core::models::{ApiKeyRecord, ApiKeySummary, AuditEvent, Session, SessionDiff};
use third_eye_core::provider::ProviderClient;
use third_eye_core::response::{codes, OverseerResponse, PipelineEvent};
use third_eye_core::{Persistence, ThirdEyeConfig};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::subsystems::auth::{AuthError, AuthManager};
use crate::subsystems::bus::PipelineBus;
use crate::subsystems::eyes::{self, EyeContext, EyeFailure, EyeRegistry};
use crate::subsystems::overseer::{Overseer, NEXT_SUBMIT_CLARIFICATIONS};
use crate::subsystems::quota::QuotaManager;
use crate::subsystems::session::SessionStore;
use crate::ws;

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";
pub const CONNECTION_ID_HEADER: &str = "X-Connection-Id";

pub struct AppState {
    pub config: ThirdEyeConfig,
    pub persistence: Persistence,
    pub provider: Arc<ProviderClient>,
    pub bus: Arc<PipelineBus>,
    pub sessions: Arc<SessionStore>,
    pub quota: Arc<QuotaManager>,
    pub auth: Arc<AuthManager>,
    pub registry: Arc<EyeRegistry>,
    pub overseer: Arc<Overseer>,
    pub metrics: Arc<Metrics>,
    pub csrf: Arc<CsrfSigner>,
}

impl AppState {
    pub fn new(
        config: ThirdEyeConfig,
        persistence: Persistence,
        provider: Arc<ProviderClient>,
        server_secret: &str,
    ) -> Arc<Self> {
        let bus = Arc::new(PipelineBus::new(
            config.bus.ring_capacity,
            config.bus.subscriber_queue,
        ));
        let sessions = Arc::new(SessionStore::new(config.sessions.ttl_seconds));
        let quota = Arc::new(QuotaManager::new(
            config.quota.window_seconds,
            config.quota.sub_buckets,
            config.quota.default_limit,
        ));
        let auth = Arc::new(AuthManager::new(
            persistence.clone(),
            server_secret,
            config.auth.key_rate_per_minute,
            config.auth.admin_session_ttl_seconds,
        ));
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(eyes::build_registry(
            &provider,
            &metrics,
            Duration::from_secs(config.orchestration.eye_timeout_seconds),
        ));
        let overseer = Arc::new(Overseer::new(
            registry.clone(),
            provider.clone(),
            bus.clone(),
            persistence.clone(),
            metrics.clone(),
            Duration::from_secs(config.orchestration.routing_timeout_seconds),
            Duration::from_secs(config.orchestration.overall_timeout_seconds),
            config.sessions.ambiguity_threshold,
        ));
        let csrf = Arc::new(CsrfSigner::new(server_secret, config.auth.csrf_ttl_seconds));

        Arc::new(Self {
            config,
            persistence,
            provider,
            bus,
            sessions,
            quota,
            auth,
            registry,
            overseer,
            metrics,
            csrf,
        })
    }

    /// Map an auth-layer rejection onto the wire taxonomy.
    pub fn auth_error(&self, error: AuthError) -> ApiError {
        Metrics::incr(&self.metrics.request_errors_total);
        match error {
            AuthError::Unauthorized => ApiError::new(
                StatusCode::UNAUTHORIZED,
                codes::E_AUTH_REQUIRED,
                "Missing or invalid API key",
                Some("send the key in the X-API-Key header"),
            ),
            AuthError::RateLimited {
                retry_after_seconds,
            } => {
                Metrics::incr(&self.metrics.quota_rejections_total);
                ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    codes::E_QUOTA_EXCEEDED,
                    "API key rate limit exceeded",
                    Some(&format!("wait {} seconds", retry_after_seconds)),
                )
            }
            AuthError::Forbidden => ApiError::new(
                StatusCode::FORBIDDEN,
                codes::E_AUTH_REQUIRED,
                "Admin role required",
                None,
            ),
            AuthError::AdminSessionExpired => ApiError::new(
                StatusCode::UNAUTHORIZED,
                codes::E_SESSION_EXPIRED,
                "Admin session expired",
                Some("re-login via /admin/auth/login"),
            ),
        }
    }
}

/// Wire error: status + taxonomy code + human message + recovery hint.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: &str, hint: Option<&str>) -> Self {
        Self {
            status,
            code,
            message: message.to_string(),
            hint: hint.map(str::to_string),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "code": self.code,
            "md": self.message,
            "hint": self.hint,
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/validate", post(orchestrate_handler))
        .route("/eyes/overseer/orchestrate", post(orchestrate_handler))
        .route("/eyes/:name", post(direct_eye_handler))
        .route("/session/:id", get(session_handler))
        .route("/session/:id/clarifications", post(clarifications_handler))
        .route("/session/:id/settings", post(session_settings_handler))
        .route("/ws/pipeline/:session_id", get(ws::pipeline_ws))
        .route("/health", get(health_handler))
        .route("/health/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/auth/login", post(admin_login_handler))
        .route("/admin/keys", get(admin_list_keys).post(admin_create_key))
        .route("/admin/keys/:id", delete(admin_revoke_key))
        .route("/admin/tenants/:id/usage", get(tenant_usage_handler))
        .route("/admin/tenants/:id/quota", put(tenant_quota_handler))
        .route("/admin/tenants/:id/reset", post(tenant_reset_handler))
        .with_state(state)
}

// ============================================================================
// Request helpers
// ============================================================================

fn trace_id_from(headers: &HeaderMap) -> String {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn api_key_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').map(str::trim).find_map(|pair| {
        pair.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_string)
    })
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<ApiKeyRecord, ApiError> {
    state
        .auth
        .authenticate(api_key_from(headers).as_deref())
        .await
        .map_err(|e| state.auth_error(e))
}

/// Admission: tenant quota first, per-key rate second. Rejections are
/// audited so scenario forensics can account for every request.
async fn admit(
    state: &AppState,
    record: &ApiKeyRecord,
    trace_id: &str,
) -> Result<(), ApiError> {
    if let Some(tenant) = &record.tenant {
        if !state.quota.known(tenant) {
            if let Ok(Some(limit)) = state.persistence.fetch_tenant_limit(tenant).await {
                state.quota.ensure_limit(tenant, limit.max(0) as u32);
            }
        }
        let decision = state.quota.check_and_increment(tenant);
        if !decision.admitted {
            Metrics::incr(&state.metrics.quota_rejections_total);
            Metrics::incr(&state.metrics.request_errors_total);
            state
                .persistence
                .record_audit(&AuditEvent::new(
                    Some(tenant),
                    Some(&record.id),
                    "admit",
                    codes::E_QUOTA_EXCEEDED,
                    trace_id,
                ))
                .await;
            return Err(ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                codes::E_QUOTA_EXCEEDED,
                &format!(
                    "Tenant quota exceeded ({}/{})",
                    decision.current_usage, decision.limit
                ),
                Some(&format!("wait {} seconds", decision.retry_after_seconds)),
            ));
        }
    }
    state
        .auth
        .check_key_rate(record)
        .map_err(|e| state.auth_error(e))
}

async fn admin_guard(state: &AppState, headers: &HeaderMap) -> Result<ApiKeyRecord, ApiError> {
    let record = authenticate(state, headers).await?;
    state
        .auth
        .require_admin(&record)
        .map_err(|e| state.auth_error(e))?;
    Ok(record)
}

/// Double-submit check for admin mutators: header and cookie must match
/// byte for byte, and the token itself must verify and be fresh.
fn csrf_guard(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let header_token = headers
        .get(CSRF_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let cookie_token = cookie_value(headers, CSRF_COOKIE_NAME);

    let (Some(header_token), Some(cookie_token)) = (header_token, cookie_token) else {
        Metrics::incr(&state.metrics.request_errors_total);
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            codes::E_CSRF_FAILED,
            "CSRF token missing",
            Some("send the token in X-CSRF-Token and the csrf cookie"),
        ));
    };
    if header_token != cookie_token {
        Metrics::incr(&state.metrics.request_errors_total);
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            codes::E_CSRF_FAILED,
            "CSRF token mismatch",
            None,
        ));
    }
    if !state.csrf.verify(header_token) {
        Metrics::incr(&state.metrics.request_errors_total);
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            codes::E_CSRF_FAILED,
            "CSRF token invalid or expired",
            Some("re-login to obtain a fresh token"),
        ));
    }
    Ok(())
}

/// Bind the request to a session: an explicit session id wins when it
/// names a live session, otherwise the connection binding supplies one.
/// The resolved id is injected back into the envelope context.
fn resolve_session(
    state: &AppState,
    envelope: &mut WorkEnvelope,
    headers: &HeaderMap,
    record: &ApiKeyRecord,
) -> Session {
    let session = match envelope
        .context
        .session_id
        .as_deref()
        .and_then(|id| state.sessions.get_by_id(id))
    {
        Some(session) => session,
        None => {
            let connection_id = headers
                .get(CONNECTION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| format!("key:{}", record.id));
            let session = state.sessions.get_or_create(&connection_id);
            state
                .sessions
                .update(
                    &connection_id,
                    SessionDiff {
                        tenant: record.tenant.clone(),
                        user_id: envelope.context.user_id.clone(),
                        lang: Some(envelope.context.lang.clone()),
                        budget_tokens: Some(envelope.context.budget_tokens),
                    },
                )
                .unwrap_or(session)
        }
    };
    envelope.context.session_id = Some(session.id.clone());
    envelope.context.tenant = record.tenant.clone();
    session
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        codes::E_BAD_PAYLOAD_SCHEMA => StatusCode::BAD_REQUEST,
        codes::E_LLM_ERROR => StatusCode::SERVICE_UNAVAILABLE,
        codes::E_INTERNAL => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    }
}

// ============================================================================
// Orchestration endpoints
// ============================================================================

async fn orchestrate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<OverseerResponse>), ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    let trace_id = trace_id_from(&headers);
    let record = authenticate(&state, &headers).await?;
    admit(&state, &record, &trace_id).await?;

    let mut envelope = WorkEnvelope::from_wire(body).map_err(|issue| {
        Metrics::incr(&state.metrics.request_errors_total);
        ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::E_BAD_PAYLOAD_SCHEMA,
            &format!("{}: {}", issue.field, issue.message),
            Some(&issue.hint),
        )
    })?;

    let session = resolve_session(&state, &mut envelope, &headers, &record);
    finish_orchestration(&state, &record, &trace_id, session, envelope).await
}

/// Shared tail of every orchestration path: run the pipeline, park the
/// envelope when clarifications are requested, touch + persist the
/// session, audit the outcome.
async fn finish_orchestration(
    state: &AppState,
    record: &ApiKeyRecord,
    trace_id: &str,
    session: Session,
    envelope: WorkEnvelope,
) -> Result<(StatusCode, Json<OverseerResponse>), ApiError> {
    let mut response = state.overseer.orchestrate(&session, &envelope).await;
    if let Some(data) = response.data.as_object_mut() {
        data.insert("session_id".to_string(), json!(session.id));
    }

    if response.next_action == NEXT_SUBMIT_CLARIFICATIONS {
        state
            .sessions
            .set_pending_envelope(&session.id, envelope.clone());
    }
    state.sessions.touch(&session.id);
    if let Some(current) = state.sessions.get_by_id(&session.id) {
        if let Err(e) = state.persistence.upsert_session(&current).await {
            tracing::warn!("session persist failed (continuing): {}", e);
        }
    }
    state
        .persistence
        .record_audit(&AuditEvent::new(
            record.tenant.as_deref(),
            Some(&record.id),
            "orchestrate",
            &response.code,
            trace_id,
        ))
        .await;
    if !response.ok {
        Metrics::incr(&state.metrics.request_errors_total);
    }
    Ok((status_for_code(&response.code), Json(response)))
}

#[derive(Debug, Deserialize)]
struct ClarificationAnswers {
    #[serde(default)]
    answers: Vec<ClarificationAnswer>,
}

#[derive(Debug, Deserialize)]
struct ClarificationAnswer {
    question: String,
    answer: String,
}

/// Clarification answers AUGMENT the parked envelope's context_info
/// (`clarification:<question>` keys); the merged envelope re-enters
/// orchestration.
async fn clarifications_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClarificationAnswers>,
) -> Result<(StatusCode, Json<OverseerResponse>), ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    let trace_id = trace_id_from(&headers);
    let record = authenticate(&state, &headers).await?;
    admit(&state, &record, &trace_id).await?;

    let session = state.sessions.get_by_id(&session_id).ok_or_else(|| {
        Metrics::incr(&state.metrics.request_errors_total);
        ApiError::new(
            StatusCode::NOT_FOUND,
            codes::E_BAD_PAYLOAD_SCHEMA,
            "unknown or expired session id",
            Some("run /validate first to open a session"),
        )
    })?;

    let mut envelope = state
        .sessions
        .take_pending_envelope(&session_id)
        .ok_or_else(|| {
            Metrics::incr(&state.metrics.request_errors_total);
            ApiError::new(
                StatusCode::BAD_REQUEST,
                codes::E_BAD_PAYLOAD_SCHEMA,
                "no clarifications pending for this session",
                Some("submit a work package first"),
            )
        })?;

    if body.answers.is_empty() {
        // Put the envelope back; the host may retry with real answers.
        state.sessions.set_pending_envelope(&session_id, envelope);
        Metrics::incr(&state.metrics.request_errors_total);
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::E_BAD_PAYLOAD_SCHEMA,
            "answers: at least one answer is required",
            None,
        ));
    }

    for answer in &body.answers {
        envelope.payload.context_info.insert(
            format!("clarification:{}", answer.question),
            Value::String(answer.answer.clone()),
        );
    }

    // Observers see the host's answers the moment they arrive.
    let answers: Vec<Value> = body
        .answers
        .iter()
        .map(|a| json!({"question": a.question, "answer": a.answer}))
        .collect();
    let stamped = state.bus.publish(
        &session.id,
        PipelineEvent::new(
            third_eye_core::response::event_types::USER_INPUT,
            &session.id,
            None,
            json!({"answers": answers}),
        ),
    );
    state.persistence.log_pipeline_event(&stamped).await;

    finish_orchestration(&state, &record, &trace_id, session, envelope).await
}

#[derive(Debug, Deserialize)]
struct SessionSettings {
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    budget_tokens: Option<i64>,
}

/// Session-scoped settings. Applied through the store's single-writer
/// path and broadcast to observers as a `settings_update` event.
async fn session_settings_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SessionSettings>,
) -> Result<Json<Session>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    let record = authenticate(&state, &headers).await?;
    let trace_id = trace_id_from(&headers);
    admit(&state, &record, &trace_id).await?;

    let diff = SessionDiff {
        lang: body.lang.clone(),
        budget_tokens: body.budget_tokens,
        ..SessionDiff::default()
    };
    let session = state
        .sessions
        .update_by_id(&session_id, diff)
        .ok_or_else(|| {
            Metrics::incr(&state.metrics.request_errors_total);
            ApiError::new(
                StatusCode::NOT_FOUND,
                codes::E_BAD_PAYLOAD_SCHEMA,
                "unknown or expired session id",
                None,
            )
        })?;

    let stamped = state.bus.publish(
        &session_id,
        PipelineEvent::new(
            third_eye_core::response::event_types::SETTINGS_UPDATE,
            &session_id,
            None,
            json!({"lang": session.lang, "budget_tokens": session.budget_tokens}),
        ),
    );
    state.persistence.log_pipeline_event(&stamped).await;
    state.sessions.touch(&session_id);
    Ok(Json(session))
}

/// Direct Eye invocation: the documented fallback when routing is
/// unavailable, and the raw interface for hosts that know exactly which
/// gate they want.
async fn direct_eye_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    let trace_id = trace_id_from(&headers);
    let record = authenticate(&state, &headers).await?;
    admit(&state, &record, &trace_id).await?;

    if !state.registry.contains(&name) {
        Metrics::incr(&state.metrics.request_errors_total);
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            codes::E_BAD_PAYLOAD_SCHEMA,
            &format!("unknown eye: {}", name),
            Some("GET /health lists registered eyes"),
        ));
    }

    let mut envelope = WorkEnvelope::from_wire(body).map_err(|issue| {
        Metrics::incr(&state.metrics.request_errors_total);
        ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::E_BAD_PAYLOAD_SCHEMA,
            &format!("{}: {}", issue.field, issue.message),
            Some(&issue.hint),
        )
    })?;
    let session = resolve_session(&state, &mut envelope, &headers, &record);

    let context = EyeContext {
        session: session.clone(),
        prior_results: Vec::new(),
        ambiguity_threshold: state.config.sessions.ambiguity_threshold,
    };
    let result = match state.registry.dispatch(&name, &context, &envelope).await {
        Ok(result) => result,
        Err(failure) => {
            Metrics::incr(&state.metrics.eye_failures_total);
            Metrics::incr(&state.metrics.request_errors_total);
            let (status, code) = match &failure {
                EyeFailure::Provider(_) | EyeFailure::Timeout => {
                    (StatusCode::SERVICE_UNAVAILABLE, codes::E_LLM_ERROR)
                }
                EyeFailure::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, codes::E_INTERNAL)
                }
            };
            state
                .persistence
                .record_audit(&AuditEvent::new(
                    record.tenant.as_deref(),
                    Some(&record.id),
                    &format!("eye:{}", name),
                    code,
                    &trace_id,
                ))
                .await;
            return Err(ApiError::new(status, code, &failure.describe(), None));
        }
    };

    let stamped = state
        .bus
        .publish(&session.id, PipelineEvent::eye_update(&session.id, &result));
    state.persistence.log_pipeline_event(&stamped).await;
    state.sessions.touch(&session.id);
    state
        .persistence
        .record_audit(&AuditEvent::new(
            record.tenant.as_deref(),
            Some(&record.id),
            &format!("eye:{}", name),
            &result.code,
            &trace_id,
        ))
        .await;

    let body = json!({
        "ok": result.ok,
        "code": result.code,
        "md": result.md,
        "data": result.data,
        "session_id": session.id,
    });
    Ok((StatusCode::OK, Json(body)))
}

// ============================================================================
// Session endpoints
// ============================================================================

async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Session>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    authenticate(&state, &headers).await?;
    state
        .sessions
        .get_by_id(&session_id)
        .map(Json)
        .ok_or_else(|| {
            Metrics::incr(&state.metrics.request_errors_total);
            ApiError::new(
                StatusCode::NOT_FOUND,
                codes::E_BAD_PAYLOAD_SCHEMA,
                "unknown or expired session id",
                None,
            )
        })
}

// ============================================================================
// Health & metrics
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let database = match state.persistence.health_check().await {
        Ok(version) => json!({"ok": true, "version": version}),
        Err(e) => json!({"ok": false, "error": e.to_string()}),
    };
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "sessions": state.sessions.session_count(),
        "eyes": state.registry.names(),
    }))
}

pub async fn ready_inner(state: &AppState) -> (StatusCode, Value) {
    let database = state.persistence.health_check().await.is_ok();
    let llm = state.provider.health().await;
    let ready = database && llm;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        json!({
            "status": if ready { "ready" } else { "not_ready" },
            "database": database,
            "llm": llm,
        }),
    )
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = ready_inner(&state).await;
    (status, Json(body))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render(state.bus.dropped_total());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

// ============================================================================
// Admin endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

/// Login issues three artifacts at once: an admin API key, an admin
/// session bound to it, and the CSRF cookie/token pair.
async fn admin_login_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    Metrics::incr(&state.metrics.requests_total);

    let auth_config = &state.config.auth;
    let (Some(email), Some(password_hash)) = (
        auth_config.admin_email.as_deref(),
        auth_config.admin_password_sha256.as_deref(),
    ) else {
        Metrics::incr(&state.metrics.request_errors_total);
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            codes::E_AUTH_REQUIRED,
            "admin account is not configured",
            None,
        ));
    };

    let presented = keys::hash_password(&body.password, &auth_config.admin_password_salt);
    if body.email != email || presented != password_hash {
        Metrics::incr(&state.metrics.request_errors_total);
        state
            .persistence
            .record_audit(&AuditEvent::new(
                None,
                None,
                "admin_login",
                codes::E_AUTH_REQUIRED,
                &Uuid::new_v4().to_string(),
            ))
            .await;
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            codes::E_AUTH_REQUIRED,
            "invalid credentials",
            None,
        ));
    }

    let raw_key = keys::generate_api_key();
    let key_id = keys::generate_key_id();
    let record = ApiKeyRecord {
        id: key_id.clone(),
        hashed_secret: state.auth.hash(&raw_key),
        role: third_eye_core::models::ROLE_ADMIN.to_string(),
        tenant: None,
        display_name: Some(format!("admin:{}", email)),
        limits: json!({}),
        created_at: chrono::Utc::now(),
        expires_at: None,
        revoked_at: None,
    };
    state.auth.register_key(record).await;
    let session = state.auth.create_admin_session(&key_id);
    let csrf_token = state.csrf.issue();

    let cookie = format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={}",
        CSRF_COOKIE_NAME, csrf_token, state.config.auth.csrf_ttl_seconds
    );
    let body = json!({
        "ok": true,
        "api_key": raw_key,
        "key_id": key_id,
        "csrf_token": csrf_token,
        "session_expires_at": session.expires_at,
    });
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

async fn admin_list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    admin_guard(&state, &headers).await?;
    let keys: Vec<ApiKeySummary> = state
        .auth
        .list_keys()
        .await
        .iter()
        .map(ApiKeySummary::from)
        .collect();
    Ok(Json(json!({"ok": true, "keys": keys})))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    limits: Option<Value>,
}

async fn admin_create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    let admin = admin_guard(&state, &headers).await?;
    csrf_guard(&state, &headers)?;

    let raw_key = keys::generate_api_key();
    let key_id = keys::generate_key_id();
    let record = ApiKeyRecord {
        id: key_id.clone(),
        hashed_secret: state.auth.hash(&raw_key),
        role: body
            .role
            .unwrap_or_else(|| third_eye_core::models::ROLE_CONSUMER.to_string()),
        tenant: body.tenant,
        display_name: body.display_name,
        limits: body.limits.unwrap_or_else(|| json!({})),
        created_at: chrono::Utc::now(),
        expires_at: body
            .ttl_seconds
            .map(|ttl| chrono::Utc::now() + chrono::Duration::seconds(ttl as i64)),
        revoked_at: None,
    };
    let summary = ApiKeySummary::from(&record);
    state.auth.register_key(record).await;
    state
        .persistence
        .record_audit(&AuditEvent::new(
            None,
            Some(&admin.id),
            "create_key",
            "OK",
            &trace_id_from(&headers),
        ))
        .await;

    // The raw secret appears exactly once, in this response.
    Ok(Json(json!({"ok": true, "api_key": raw_key, "key": summary})))
}

async fn admin_revoke_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    let admin = admin_guard(&state, &headers).await?;
    csrf_guard(&state, &headers)?;

    let revoked = state.auth.revoke_key(&key_id).await;
    state
        .persistence
        .record_audit(&AuditEvent::new(
            None,
            Some(&admin.id),
            "revoke_key",
            if revoked { "OK" } else { "E_NOT_FOUND" },
            &trace_id_from(&headers),
        ))
        .await;
    Ok(Json(json!({"ok": revoked, "key_id": key_id})))
}

async fn tenant_usage_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    admin_guard(&state, &headers).await?;
    Ok(Json(json!({
        "ok": true,
        "tenant": tenant,
        "usage": state.quota.get_usage(&tenant),
        "limit": state.quota.get_limit(&tenant),
    })))
}

#[derive(Debug, Deserialize)]
struct SetQuotaRequest {
    limit: u32,
}

async fn tenant_quota_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SetQuotaRequest>,
) -> Result<Json<Value>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    let admin = admin_guard(&state, &headers).await?;
    csrf_guard(&state, &headers)?;

    state.quota.set_limit(&tenant, body.limit);
    if let Err(e) = state
        .persistence
        .upsert_tenant_limit(&tenant, i64::from(body.limit))
        .await
    {
        tracing::warn!("tenant limit persist failed (continuing): {}", e);
    }
    state
        .persistence
        .record_audit(&AuditEvent::new(
            Some(&tenant),
            Some(&admin.id),
            "set_quota",
            "OK",
            &trace_id_from(&headers),
        ))
        .await;
    Ok(Json(json!({"ok": true, "tenant": tenant, "limit": body.limit})))
}

async fn tenant_reset_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    Metrics::incr(&state.metrics.requests_total);
    admin_guard(&state, &headers).await?;
    csrf_guard(&state, &headers)?;
    state.quota.reset(&tenant);
    Ok(Json(json!({"ok": true, "tenant": tenant})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        assert_eq!(status_for_code(codes::E_BAD_PAYLOAD_SCHEMA), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_code(codes::E_LLM_ERROR), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for_code(codes::E_ORCHESTRATION_FAILED), StatusCode::OK);
        assert_eq!(status_for_code(codes::OK_ALL), StatusCode::OK);
        assert_eq!(status_for_code(codes::E_INTERNAL), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "a=1; third-eye-csrf=tok:123:sig; b=2".parse().unwrap(),
        );
        assert_eq!(
            cookie_value(&headers, CSRF_COOKIE_NAME).as_deref(),
            Some("tok:123:sig")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn trace_id_propagates_or_generates() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, "trace-abc".parse().unwrap());
        assert_eq!(trace_id_from(&headers), "trace-abc");

        let generated = trace_id_from(&HeaderMap::new());
        assert!(!generated.is_empty());
    }
}
