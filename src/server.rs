//! HTTP surface: analysis admission, signup checks, quota display, webhooks
//! and the admin usage log.
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use chrono::{NaiveDate, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::admission::{AdmissionController, AdmissionRequest, AnalysisOutcome, Denial};
use crate::analysis::{AnalysisEngine, Submission, Upload, ValidationError};
use crate::config::ServerConfig;
use crate::identity::{ClientIp, ClientIpResolver, UserId};
use crate::model::{PlanType, UsageLogFilter};
use crate::quota::{QuotaDenial, QuotaManager, QuotaStatus};
use crate::signup::{SignupAttempt, SignupBlock, SignupGuard, SignupVerdict};
use crate::window::retry_after_secs;

/// Room for multipart framing and text fields on top of the largest upload.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;
const DEFAULT_RETRY_AFTER_SECS: u64 = 3600;
const UPGRADE_URL: &str = "/pricing";

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ClientIpResolver>,
    pub admission: Arc<AdmissionController>,
    pub quota: Arc<QuotaManager>,
    pub signup: Arc<SignupGuard>,
    pub engine: Arc<dyn AnalysisEngine>,
    pub metrics: Option<PrometheusHandle>,
    pub webhook_token: Option<String>,
    pub admin_token: Option<String>,
}

impl AppState {
    fn client_ip(&self, headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> ClientIp {
        self.resolver
            .resolve(headers, peer.map(|ConnectInfo(addr)| addr.ip()))
    }
}

/// Serves the router until interrupted.
pub struct ScanGuardServer {
    config: Arc<ServerConfig>,
    state: AppState,
}

impl ScanGuardServer {
    pub const fn new(config: Arc<ServerConfig>, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen))?;
        info!(address = %self.config.listen, "listening for analysis requests");

        let app = build_router(self.state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub fn build_router(state: AppState) -> Router {
    let upload_limit = state
        .admission
        .rules()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD);
    let upload_limit = usize::try_from(upload_limit).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/analyze",
            post(analyze).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/signup-verify", post(signup_verify))
        .route("/check-quota", post(check_quota))
        .route("/identity/user-created", post(user_created))
        .route("/billing/plan-assignments", post(plan_assignment))
        .route("/admin/usage-logs", get(usage_logs))
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn healthz() -> Response {
    json_response(StatusCode::OK, &json!({ "ok": true }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    let Some(handle) = &state.metrics else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "metrics are disabled");
    };
    let mut response = Response::new(axum::body::Body::from(handle.render()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn analyze(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let ip = state.client_ip(&headers, peer);
    if ip.is_unknown() {
        warn!("client address unresolved; using the shared bucket");
    }
    info!(ip = %ip, "analysis request");

    let (user, submission) = match read_submission(multipart).await {
        Ok(form) => form,
        Err(FormError::Multipart(err)) => {
            warn!(ip = %ip, error = %err, "unreadable analysis form");
            return error_response(err.status(), "invalid_form", &err.body_text());
        }
        Err(FormError::UserId) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_user", "invalid userId");
        }
    };

    let request = AdmissionRequest { ip, user };
    let outcome = state
        .admission
        .analyze(&request, submission, state.engine.as_ref())
        .await;
    outcome_response(&state, outcome)
}

enum FormError {
    Multipart(MultipartError),
    UserId,
}

async fn read_submission(
    mut multipart: Multipart,
) -> Result<(Option<UserId>, Submission), FormError> {
    let mut user = None;
    let mut submission = Submission::default();
    while let Some(field) = multipart.next_field().await.map_err(FormError::Multipart)? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "userId" => {
                let raw = field.text().await.map_err(FormError::Multipart)?;
                if !raw.trim().is_empty() {
                    user = Some(UserId::parse(&raw).map_err(|_| FormError::UserId)?);
                }
            }
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_owned();
                let content_type = field.content_type().unwrap_or_default().to_owned();
                let bytes = field.bytes().await.map_err(FormError::Multipart)?;
                submission.upload = Some(Upload {
                    file_name,
                    content_type,
                    bytes,
                });
            }
            "videoUrl" | "youtubeUrl" => {
                submission.video_url = Some(field.text().await.map_err(FormError::Multipart)?);
            }
            _ => {}
        }
    }
    Ok((user, submission))
}

fn outcome_response(state: &AppState, outcome: AnalysisOutcome) -> Response {
    match outcome {
        AnalysisOutcome::Completed(verdict) => json_response(
            StatusCode::OK,
            &json!({
                "verdict": verdict.verdict,
                "confidence": verdict.confidence,
                "reasoning": verdict.reasoning,
            }),
        ),
        AnalysisOutcome::Denied(denial) => denial_response(state, &denial),
        AnalysisOutcome::Rejected(err) => {
            let status = match err {
                ValidationError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            error_response(status, "invalid_input", &err.to_string())
        }
        AnalysisOutcome::Failed(err) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({
                "error": "Failed to analyze video",
                "code": "analysis_failed",
                "details": err.public_detail(),
            }),
        ),
    }
}

fn denial_response(state: &AppState, denial: &Denial) -> Response {
    match denial {
        Denial::FreeScanUsed => json_response(
            StatusCode::FORBIDDEN,
            &json!({
                "error": "Upgrade required",
                "code": denial.code(),
                "message": "Your free scan has already been used. Please upgrade to continue.",
                "upgradeUrl": UPGRADE_URL,
            }),
        ),
        Denial::RateLimited(status) => {
            let settings = state.admission.limiter().settings();
            let retry_after = status
                .reset_at
                .map_or(DEFAULT_RETRY_AFTER_SECS, |reset| {
                    retry_after_secs(Utc::now(), reset)
                });
            let mut response = json_response(
                StatusCode::TOO_MANY_REQUESTS,
                &json!({
                    "error": "Rate limit exceeded",
                    "code": denial.code(),
                    "message": format!(
                        "Maximum {} analysis requests per {} hours exceeded",
                        settings.max_requests,
                        settings.window.as_secs() / 3600
                    ),
                    "remaining": status.remaining,
                    "resetTime": status.reset_at,
                    "retryAfter": retry_after,
                }),
            );
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
        Denial::QuotaExhausted(status) => quota_denial_response(denial.code(), status),
    }
}

fn quota_denial_response(code: &str, status: &QuotaStatus) -> Response {
    if let Some(reason @ QuotaDenial::StoreUnavailable) = status.reason {
        // Nothing to upgrade: the usage ledger just could not be read.
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({
                "error": "Usage check unavailable",
                "code": code,
                "reason": reason.code(),
                "message": reason.message(),
            }),
        );
    }
    json_response(
        StatusCode::PAYMENT_REQUIRED,
        &json!({
            "error": "Usage limit reached",
            "code": code,
            "reason": status.reason.map(|reason| reason.code()),
            "message": status.reason.map(|reason| reason.message()),
            "usage": status.usage,
            "limit": status.limit,
            "plan": status.plan,
            "upgradeUrl": UPGRADE_URL,
        }),
    )
}

#[derive(Debug, Deserialize)]
struct SignupVerifyBody {
    #[serde(default)]
    email: Option<String>,
}

async fn signup_verify(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed: SignupVerifyBody = match parse_json_body(&body) {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "invalid_json", &message),
    };
    let Some(email) = parsed.email.filter(|email| !email.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing_email", "Email is required");
    };
    let ip = state.client_ip(&headers, peer);

    let body = match state.signup.verify(&email, &ip).await {
        SignupVerdict::Allowed { count, remaining } => json!({
            "allowed": true,
            "count": count,
            "remaining": remaining,
        }),
        SignupVerdict::Blocked(block) => blocked_signup_body(&block),
    };
    json_response(StatusCode::OK, &body)
}

fn blocked_signup_body(block: &SignupBlock) -> Value {
    match block {
        SignupBlock::BlockedDomain { domain } => json!({
            "allowed": false,
            "code": block.code(),
            "reason": block.message(),
            "blockedDomain": domain,
        }),
        SignupBlock::TooManySignups(status) => json!({
            "allowed": false,
            "code": block.code(),
            "reason": block.message(),
            "rateLimited": true,
            "resetTime": status.reset_time,
            "count": status.count,
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserBody {
    #[serde(default)]
    user_id: Option<String>,
}

async fn check_quota(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: UserBody = match parse_json_body(&body) {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "invalid_json", &message),
    };
    let user = match required_user(parsed.user_id.as_deref()) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let summary = state.quota.quota_summary(&user).await;
    json_response(StatusCode::OK, &json!(summary))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserCreatedBody {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
}

async fn user_created(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(response) = authorize(state.webhook_token.as_deref(), &headers) {
        return response;
    }
    let parsed: UserCreatedBody = match parse_json_body(&body) {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "invalid_json", &message),
    };
    let user_id = match required_user(parsed.user_id.as_deref()) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Some(email) = parsed.email.filter(|email| !email.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing_email", "No email provided");
    };
    let user_agent = parsed.user_agent.or_else(|| {
        headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    });

    let attempt = SignupAttempt {
        user_id,
        ip: state.client_ip(&headers, peer),
        email,
        user_agent,
    };
    let body = match state.signup.register(&attempt).await {
        SignupVerdict::Allowed { .. } => json!({ "ok": true, "blocked": false }),
        SignupVerdict::Blocked(block) => {
            let reset_time = match &block {
                SignupBlock::TooManySignups(status) => status.reset_time,
                SignupBlock::BlockedDomain { .. } => None,
            };
            json!({
                "ok": true,
                "blocked": true,
                "code": block.code(),
                "reason": block.message(),
                "resetTime": reset_time,
            })
        }
    };
    json_response(StatusCode::OK, &body)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanAssignmentBody {
    #[serde(default)]
    user_id: Option<String>,
    plan_type: String,
}

async fn plan_assignment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(response) = authorize(state.webhook_token.as_deref(), &headers) {
        return response;
    }
    let parsed: PlanAssignmentBody = match parse_json_body(&body) {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "invalid_json", &message),
    };
    let user = match required_user(parsed.user_id.as_deref()) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let plan_type = match parsed.plan_type.parse::<PlanType>() {
        Ok(plan_type) => plan_type,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_plan", &err.to_string());
        }
    };
    match state.quota.assign_plan(&user, plan_type).await {
        Ok(plan) => json_response(StatusCode::OK, &json!({ "ok": true, "plan": plan })),
        Err(err) => {
            warn!(user = %user, error = %err, "plan assignment failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "plan could not be saved",
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsageLogQuery {
    user_id: Option<String>,
    ip_address: Option<String>,
    verdict: Option<String>,
    date: Option<NaiveDate>,
}

async fn usage_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageLogQuery>,
) -> Response {
    if let Some(response) = authorize(state.admin_token.as_deref(), &headers) {
        return response;
    }
    let user_id = match query.user_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(raw) => match UserId::parse(raw) {
            Ok(user) => Some(user),
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid_user", &err.to_string());
            }
        },
        None => None,
    };
    let filter = UsageLogFilter {
        user_id,
        ip: query
            .ip_address
            .as_deref()
            .filter(|ip| !ip.trim().is_empty())
            .map(ClientIp::new),
        verdict: query.verdict.filter(|verdict| !verdict.is_empty()),
        date: query.date,
    };

    match state.admission.usage_logs(&filter).await {
        Ok(logs) => json_response(StatusCode::OK, &json!({ "logs": logs })),
        Err(err) => {
            warn!(error = %err, "usage log listing failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "usage logs unavailable",
            )
        }
    }
}

fn required_user(raw: Option<&str>) -> Result<UserId, Response> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing_user",
            "User ID required",
        ));
    };
    UserId::parse(raw)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, "invalid_user", &err.to_string()))
}

fn parse_json_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, String> {
    serde_json::from_slice(body).map_err(|error| format!("invalid json body: {error}"))
}

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let left = left.as_bytes();
    let right = right.as_bytes();
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0_u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Rejects the request unless it carries the expected bearer token. An
/// unconfigured token disables the endpoint.
fn authorize(expected: Option<&str>, headers: &HeaderMap) -> Option<Response> {
    let authorized = expected.is_some_and(|expected| {
        bearer_token_from_headers(headers).is_some_and(|token| constant_time_eq(token, expected))
    });
    if authorized {
        return None;
    }
    let mut response = error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "missing or invalid bearer token",
    );
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer realm=\"scanguard\""),
    );
    Some(response)
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    json_response(status, &json!({ "error": message, "code": code }))
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    let mut response = Response::new(axum::body::Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}
