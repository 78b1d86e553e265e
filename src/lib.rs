//! Core library for qgate.  This module wires the chat service, the
//! admin operations and the operational endpoints into one axum router.
//! Handlers stay thin: every decision lives in [`orchestrator::ChatService`].

mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod security;
pub mod upstream;
pub mod util;

pub use config::{AppConfig, CodecSecrets, PolicyConfig};

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    ConnectInfo, DefaultBodyLimit, Path, Query, State,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::error::GatewayError;
use crate::ledger::{Ledger, SqliteLedger};
use crate::orchestrator::{AnalyticsPeriod, Caller, ChatService, CredentialsInput, HistorySource};
use crate::security::{AccessEvaluator, RateLimiter, SecretCodec};
use crate::upstream::{ChatBackend, QBusinessClient};
use crate::util::{Clock, SystemClock};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(flatten)]
    pub caller: Caller,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub source: HistorySource,
    #[serde(flatten)]
    pub caller: Caller,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(flatten)]
    pub caller: Caller,
}

#[derive(Debug, Deserialize)]
struct AnalyticsQuery {
    #[serde(default)]
    period: AnalyticsPeriod,
}

/// Failure body shared by every endpoint.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in: Option<i64>,
    #[serde(skip)]
    pub http_status: u16,
}

impl ErrorResponse {
    fn new(http_status: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            rate_limited: None,
            reset_in: None,
            http_status,
        }
    }
}

impl From<&GatewayError> for ErrorResponse {
    fn from(err: &GatewayError) -> Self {
        let status = match err {
            GatewayError::AccessDenied(_) => 403,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Validation(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::Configuration(_) | GatewayError::Codec(_) => 503,
            GatewayError::Upstream(_) => 502,
            GatewayError::Persistence(_) => 500,
        };
        let mut body = ErrorResponse::new(status, err.user_message());
        if let GatewayError::RateLimited {
            retry_after_secs, ..
        } = err
        {
            body.rate_limited = Some(true);
            body.reset_in = Some(*retry_after_secs);
        }
        body
    }
}

/// Request counters and the send latency histogram.
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub delivered_total: AtomicU64,
    pub access_denied_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub ip_limited_total: AtomicU64,
    pub validation_failed_total: AtomicU64,
    pub upstream_failures_total: AtomicU64,
    pub faults_total: AtomicU64,
    // Histogram buckets (fixed) for send latency in ms (upper bounds) and counts
    pub hist_buckets: Vec<u64>,
    pub hist_counts: Vec<AtomicU64>,
    pub hist_sum_ms: AtomicU64,
    pub hist_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let buckets: Vec<u64> = vec![
            10, 50, 100, 250, 500, 1000, 2000, 5000, 10_000, 30_000,
        ];
        Self {
            requests_total: AtomicU64::new(0),
            delivered_total: AtomicU64::new(0),
            access_denied_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            ip_limited_total: AtomicU64::new(0),
            validation_failed_total: AtomicU64::new(0),
            upstream_failures_total: AtomicU64::new(0),
            faults_total: AtomicU64::new(0),
            hist_counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_buckets: buckets,
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
        }
    }

    fn observe_latency(&self, ms: u64) {
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        // find first bucket >= value
        for (idx, ub) in self.hist_buckets.iter().enumerate() {
            if ms <= *ub {
                self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    fn count_failure(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::AccessDenied(_) => &self.access_denied_total,
            GatewayError::RateLimited { .. } => &self.rate_limited_total,
            GatewayError::Validation(_) => &self.validation_failed_total,
            GatewayError::Upstream(_) => &self.upstream_failures_total,
            _ => &self.faults_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    /// Client bearer allowlist (None => client routes reject every request).
    /// Identity and roles arrive in the request body, so the host holding
    /// one of these tokens is the only trusted caller.
    pub allowed_tokens: Option<HashSet<String>>,
    /// Admin bearer allowlist (None => admin routes reject every request).
    pub admin_tokens: Option<HashSet<String>>,
    /// Maximum accepted raw request body size in bytes (None => unlimited)
    pub max_request_bytes: Option<usize>,
    /// Use the first `X-Forwarded-For` hop as the client IP.
    pub trust_forwarded_for: bool,
    pub metrics: Arc<Metrics>,
    // Process start time (epoch secs) and instant for uptime computation
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Assemble state around externally supplied collaborators.
pub fn build_state_with(
    config: &AppConfig,
    ledger: Arc<dyn Ledger>,
    backend: Arc<dyn ChatBackend>,
    clock: Arc<dyn Clock>,
) -> AppState {
    let codec = SecretCodec::from_secrets(&config.secrets.auth_key, &config.secrets.secure_auth_key);
    let access = AccessEvaluator::new(config.policy.access.clone());
    let limiter = RateLimiter::new(
        config.policy.rate_limits.clone(),
        ledger.clone(),
        clock.clone(),
        config.utc_offset,
    );
    let service = ChatService::new(access, limiter, backend, ledger, codec, clock)
        .with_max_message_length(config.policy.max_message_length)
        .with_retention_days(config.retention_days);

    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    AppState {
        service: Arc::new(service),
        allowed_tokens: config.allowed_tokens.clone(),
        admin_tokens: config.admin_tokens.clone(),
        max_request_bytes: config.max_request_bytes,
        trust_forwarded_for: config.trust_forwarded_for,
        metrics: Arc::new(Metrics::new()),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    }
}

/// Open the SQLite ledger and the Q Business client described by `config`.
pub async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger: Arc<dyn Ledger> = Arc::new(
        SqliteLedger::open(&config.database_path, clock.clone())
            .await
            .with_context(|| format!("Failed to open database '{}'", config.database_path))?,
    );
    let codec = SecretCodec::from_secrets(&config.secrets.auth_key, &config.secrets.secure_auth_key);
    let backend: Arc<dyn ChatBackend> = Arc::new(
        QBusinessClient::new(config.upstream.clone(), ledger.clone(), codec, clock.clone())
            .context("Failed to build upstream client")?,
    );
    if config.allowed_tokens.is_none() {
        tracing::warn!("Client API disabled: QGATE_ALLOWED_TOKENS not set");
    }
    if config.admin_tokens.is_none() {
        tracing::warn!("Admin API disabled: QGATE_ADMIN_TOKENS not set");
    }
    Ok(build_state_with(config, ledger, backend, clock))
}

/// Build state from environment variables.  See [`AppConfig::from_env`]
/// for the variables read.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state(&config).await
}

/// Run the retention sweep every `every` until the task is aborted.
pub fn spawn_cleanup(service: Arc<ChatService>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately; sweep on the next one.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = service.cleanup().await {
                tracing::error!(error = %err, "scheduled cleanup failed");
            }
        }
    })
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/v1/chat/send", post(send_handler))
        .route("/v1/chat/history", post(history_handler))
        .route("/v1/chat/reset", post(reset_handler))
        .route("/v1/access/check", post(access_check_handler))
        .route("/v1/rate-limit/status", post(rate_status_handler))
        .route("/v1/events", post(event_handler))
        .route("/admin/connection/test", get(connection_test_handler))
        .route("/admin/credentials", post(credentials_handler))
        .route("/admin/maintenance/cleanup", post(cleanup_handler))
        .route("/admin/errors/:id/resolve", post(resolve_error_handler))
        .route("/admin/analytics", get(analytics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn respond_with_gateway_error(err: &GatewayError) -> axum::response::Response {
    respond_with_error(ErrorResponse::from(err))
}

fn respond_ok<T: Serialize>(data: T) -> axum::response::Response {
    let body = serde_json::json!({ "success": true, "data": data });
    (StatusCode::OK, Json(body)).into_response()
}

fn authorization_error() -> ErrorResponse {
    ErrorResponse::new(401, "Unauthorized")
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ErrorResponse> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(authorization_error)?;

    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return Err(authorization_error());
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return Err(authorization_error());
    }
    Ok(token.to_string())
}

fn ensure_authorized(
    headers: &HeaderMap,
    allowed_tokens: Option<&HashSet<String>>,
) -> Result<(), ErrorResponse> {
    let token = extract_bearer_token(headers)?;
    match allowed_tokens {
        Some(tokens) if tokens.contains(&token) => Ok(()),
        _ => Err(authorization_error()),
    }
}

fn ensure_admin(
    headers: &HeaderMap,
    admin_tokens: Option<&HashSet<String>>,
) -> Result<(), ErrorResponse> {
    let token = extract_bearer_token(headers)?;
    match admin_tokens {
        Some(tokens) if tokens.contains(&token) => Ok(()),
        _ => Err(authorization_error()),
    }
}

/// The socket peer, or the first `X-Forwarded-For` hop when the header is
/// trusted.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> Option<String> {
    let forwarded = || {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    trust_forwarded_for
        .then(forwarded)
        .flatten()
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(limit = ?state.max_request_bytes, "request body exceeded configured limit");
            let message = match state.max_request_bytes {
                Some(limit) => format!("Request too large (body exceeded limit {} bytes)", limit),
                None => "Request too large".to_string(),
            };
            respond_with_error(ErrorResponse::new(413, message))
        }
        other => respond_with_error(ErrorResponse::new(400, format!("Invalid request: {}", other.body_text()))),
    }
}

/// Handler for `/v1/chat/send`.  The IP ceiling is applied before the
/// orchestrator sees the request.
async fn send_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let SendRequest {
        message,
        conversation_id,
        mut caller,
    } = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };

    let start = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    caller.ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr), state.trust_forwarded_for);

    if let Some(ip) = caller.ip.as_deref() {
        let decision = state.service.limiter().check_ip(ip);
        if !decision.allowed {
            state.metrics.ip_limited_total.fetch_add(1, Ordering::Relaxed);
            tracing::info!(ip = %ip, "ip rate limit exceeded");
            return respond_with_gateway_error(&GatewayError::RateLimited {
                message: decision.message.unwrap_or_default(),
                retry_after_secs: decision.retry_after_secs,
            });
        }
    }

    let result = state
        .service
        .send_message(&caller, &message, conversation_id.as_deref())
        .await;
    state
        .metrics
        .observe_latency(start.elapsed().as_millis() as u64);

    match result {
        Ok(reply) => {
            state.metrics.delivered_total.fetch_add(1, Ordering::Relaxed);
            respond_ok(reply)
        }
        Err(err) => {
            state.metrics.count_failure(&err);
            let mut body = ErrorResponse::from(&err);
            if matches!(err, GatewayError::Upstream(_)) {
                body.message = format!("Failed to send message: {}", err.user_message());
            }
            respond_with_error(body)
        }
    }
}

async fn history_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<HistoryRequest>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let request = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    match state
        .service
        .history(&request.caller, &request.conversation_id, request.source)
        .await
    {
        Ok(messages) => respond_ok(serde_json::json!({ "messages": messages })),
        Err(err) => respond_with_gateway_error(&err),
    }
}

async fn reset_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<Caller>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let mut caller = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    caller.ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr), state.trust_forwarded_for);
    match state.service.reset_conversation(&caller).await {
        Ok(()) => respond_ok(serde_json::json!({ "message": "Conversation reset." })),
        Err(err) => respond_with_gateway_error(&err),
    }
}

async fn access_check_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Caller>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    match payload {
        Ok(Json(caller)) => respond_ok(state.service.check_access(&caller)),
        Err(rejection) => handle_json_rejection(&state, rejection),
    }
}

async fn rate_status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Caller>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    match payload {
        Ok(Json(caller)) => respond_ok(state.service.rate_limit_status(&caller).await),
        Err(rejection) => handle_json_rejection(&state, rejection),
    }
}

async fn event_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<EventRequest>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let mut request = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    request.caller.ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr), state.trust_forwarded_for);
    match state
        .service
        .log_event(&request.caller, &request.action, request.metadata)
        .await
    {
        Ok(id) => respond_ok(serde_json::json!({ "id": id })),
        Err(err) => respond_with_gateway_error(&err),
    }
}

async fn connection_test_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = ensure_admin(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let report = state.service.test_connection().await;
    (StatusCode::OK, Json(report)).into_response()
}

async fn credentials_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CredentialsInput>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_admin(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let input = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    match state.service.save_credentials(&input).await {
        Ok(()) => respond_ok(serde_json::json!({ "message": "Settings saved." })),
        Err(err) => respond_with_gateway_error(&err),
    }
}

async fn cleanup_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = ensure_admin(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    match state.service.cleanup().await {
        Ok(report) => respond_ok(report),
        Err(err) => respond_with_gateway_error(&err),
    }
}

async fn resolve_error_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = ensure_admin(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    match state.service.resolve_error(id).await {
        Ok(()) => respond_ok(serde_json::json!({ "id": id, "resolved": true })),
        Err(err) => respond_with_gateway_error(&err),
    }
}

async fn analytics_handler(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = ensure_admin(&headers, state.admin_tokens.as_ref()) {
        return respond_with_error(err);
    }
    match state.service.analytics(query.period).await {
        Ok(summary) => respond_ok(summary),
        Err(err) => respond_with_gateway_error(&err),
    }
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clientEnabled": state.allowed_tokens.is_some(),
        "adminEnabled": state.admin_tokens.is_some(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut buf = String::new();
    use std::fmt::Write as _;
    let m = &state.metrics;
    let counters: [(&str, &str, u64); 3] = [
        (
            "qgate_requests_total",
            "Chat send requests received",
            m.requests_total.load(Ordering::Relaxed),
        ),
        (
            "qgate_delivered_total",
            "Chat replies delivered",
            m.delivered_total.load(Ordering::Relaxed),
        ),
        (
            "qgate_upstream_failures_total",
            "Sends that failed at the upstream service",
            m.upstream_failures_total.load(Ordering::Relaxed),
        ),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }
    writeln!(
        &mut buf,
        "# HELP qgate_denials_total Sends stopped by a gate\n# TYPE qgate_denials_total counter"
    )
    .ok();
    for (gate, counter) in [
        ("access", &m.access_denied_total),
        ("rate", &m.rate_limited_total),
        ("ip", &m.ip_limited_total),
        ("validation", &m.validation_failed_total),
    ] {
        writeln!(
            &mut buf,
            "qgate_denials_total{{gate=\"{}\"}} {}",
            gate,
            counter.load(Ordering::Relaxed)
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "# HELP qgate_faults_total Sends that failed on storage, credentials or configuration\n# TYPE qgate_faults_total counter"
    )
    .ok();
    writeln!(&mut buf, "qgate_faults_total {}", m.faults_total.load(Ordering::Relaxed)).ok();
    // Histogram
    let sum_ms = m.hist_sum_ms.load(Ordering::Relaxed);
    let count = m.hist_count.load(Ordering::Relaxed);
    writeln!(
        &mut buf,
        "# HELP qgate_send_latency_ms Send latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE qgate_send_latency_ms histogram").ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in m.hist_buckets.iter().enumerate() {
        cumulative += m.hist_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "qgate_send_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "qgate_send_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(&mut buf, "qgate_send_latency_ms_sum {}", sum_ms).ok();
    writeln!(&mut buf, "qgate_send_latency_ms_count {}", count).ok();
    writeln!(
        &mut buf,
        "# HELP qgate_build_info Build information\n# TYPE qgate_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "qgate_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP qgate_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE qgate_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "qgate_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP qgate_process_uptime_seconds Process uptime seconds\n# TYPE qgate_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "qgate_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
