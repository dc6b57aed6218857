//! Axum-based HTTP gateway in front of the shot caller.
//!
//! - `POST /v1/generate` runs one generation request end to end
//! - Tenant balance, model catalog and health are public reads
//! - `/admin/*` manages vault credentials and tenant grants behind a bearer
//!   token, compared by SHA-256 hash in constant time
//! - Request body size limit and request timeout on every route

use crate::config::Config;
use crate::dispatch::DispatchError;
use crate::error::{Denial, ShotCallerError};
use crate::providers::{self, ProviderKind};
use crate::registry::ModelView;
use crate::shotcaller::{FailureResponse, InboundRequest, ShotCaller};
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::Duration as ChronoDuration;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Default number of usage records returned by the usage endpoint.
const DEFAULT_USAGE_LIMIT: usize = 50;
/// Upper bound on the same.
const MAX_USAGE_LIMIT: usize = 1000;

fn hash_admin_token(value: &str) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub shotcaller: Arc<ShotCaller>,
    /// SHA-256 hex of the admin token. `None` disables the admin API.
    pub admin_token_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(shotcaller: Arc<ShotCaller>, admin_token: Option<&SecretString>) -> Self {
        Self {
            shotcaller,
            admin_token_hash: admin_token
                .map(|t| t.expose_secret().trim())
                .filter(|t| !t.is_empty())
                .map(|t| Arc::from(hash_admin_token(t))),
        }
    }
}

/// Routes and middleware, without binding a listener.
pub fn router(state: AppState, max_body_bytes: usize, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/generate", post(handle_generate))
        .route("/v1/models", get(handle_models))
        .route("/v1/tenants/{id}/balance", get(handle_balance))
        .route(
            "/admin/credentials",
            post(handle_add_credential).get(handle_list_credentials),
        )
        .route(
            "/admin/credentials/{id}",
            patch(handle_update_credential).delete(handle_remove_credential),
        )
        .route("/admin/tenants/{id}/grant", post(handle_grant))
        .route("/admin/tenants/{id}/usage", get(handle_tenant_usage))
        .route("/admin/usage/summary", get(handle_usage_summary))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Run the HTTP gateway until the process is stopped.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let adapters = providers::build_adapters(&config)?;
    let shotcaller = Arc::new(ShotCaller::open(&config, adapters)?);
    let state = AppState::new(Arc::clone(&shotcaller), config.gateway.admin_token.as_ref());
    if state.admin_token_hash.is_none() {
        tracing::warn!("no admin token configured; /admin routes will reject every request");
    }

    // Periodic vault reclaim and idle-tenant pruning
    let sweeper = Arc::clone(&shotcaller);
    let sweep_every = Duration::from_secs(config.vault.sweep_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            match sweeper.vault().sweep() {
                Ok(0) => {}
                Ok(reclaimed) => tracing::info!(reclaimed, "vault sweep reclaimed credentials"),
                Err(e) => tracing::error!("vault sweep failed: {e:#}"),
            }
            let pruned = sweeper.ledger().prune_idle();
            if pruned > 0 {
                tracing::debug!(pruned, "pruned idle tenant slots");
            }
        }
    });

    let app = router(
        state,
        config.gateway.max_body_bytes,
        Duration::from_secs(config.gateway.request_timeout_secs),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;
    tracing::info!(addr = %actual, models = shotcaller.registry().len(), "gateway listening");

    axum::serve(listener, app).await?;
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// ERROR MAPPING
// ══════════════════════════════════════════════════════════════════════════════

fn status_for(err: &ShotCallerError) -> StatusCode {
    match err {
        ShotCallerError::UnknownModel(_) => StatusCode::NOT_FOUND,
        ShotCallerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ShotCallerError::AdmissionDenied(Denial::InsufficientBalance { .. }) => {
            StatusCode::PAYMENT_REQUIRED
        }
        ShotCallerError::AdmissionDenied(Denial::RateLimited(_)) => StatusCode::TOO_MANY_REQUESTS,
        ShotCallerError::CredentialUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ShotCallerError::Dispatch(DispatchError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        ShotCallerError::Dispatch(DispatchError::Provider { .. }) => StatusCode::BAD_GATEWAY,
        ShotCallerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ShotCallerError) -> Response {
    if let ShotCallerError::Storage(e) = err {
        tracing::error!("storage failure: {e:#}");
    }
    let body = FailureResponse::from(err);
    let mut response = (status_for(err), Json(body)).into_response();
    if let Some(info) = match err {
        ShotCallerError::AdmissionDenied(denial) => denial.rate_limit(),
        _ => None,
    } {
        if let Ok(value) = HeaderValue::from_str(&info.retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn internal_error(e: &anyhow::Error) -> Response {
    error_response(&ShotCallerError::Storage(anyhow::anyhow!("{e:#}")))
}

fn bad_request(message: impl Into<String>) -> Response {
    error_response(&ShotCallerError::InvalidRequest(message.into()))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"success": false, "error": "Unauthorized", "errorKind": "unauthorized"})),
    )
        .into_response()
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"success": false, "error": format!("{what} not found"), "errorKind": "not_found"})),
    )
        .into_response()
}

// ══════════════════════════════════════════════════════════════════════════════
// PUBLIC HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: pool status counts only, no secrets
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "models": state.shotcaller.registry().len(),
        "vault": state.shotcaller.vault().health(),
    }))
}

/// GET /v1/models
async fn handle_models(State(state): State<AppState>) -> impl IntoResponse {
    let models: Vec<ModelView<'_>> = state
        .shotcaller
        .registry()
        .list()
        .map(ModelView::from)
        .collect();
    Json(serde_json::json!({ "models": models }))
}

/// POST /v1/generate
async fn handle_generate(
    State(state): State<AppState>,
    body: Result<Json<InboundRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(e) => return bad_request(format!("malformed request body: {}", e.body_text())),
    };

    let tenant = request.tenant_id.clone();
    let model = request.model_id.clone();
    match state.shotcaller.handle(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => {
            tracing::debug!(tenant = %tenant, model = %model, kind = err.kind(), "generate request failed");
            error_response(&err)
        }
    }
}

/// GET /v1/tenants/{id}/balance
async fn handle_balance(State(state): State<AppState>, Path(tenant_id): Path<String>) -> Response {
    let ledger = state.shotcaller.ledger();
    let reserved = ledger.reserved(&tenant_id);
    match ledger.balance(&tenant_id) {
        Ok(balance) => Json(serde_json::json!({
            "tenantId": tenant_id,
            "remainingBalance": balance,
            "reservedBlocks": reserved,
        }))
        .into_response(),
        Err(e) => internal_error(&e),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// ADMIN HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// Check `Authorization: Bearer <token>` against the stored admin token hash.
fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(ref expected_hash) = state.admin_token_hash else {
        return false;
    };
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .strip_prefix("Bearer ")
        .unwrap_or("")
        .trim();

    if token.is_empty() {
        return false;
    }

    let provided_hash = hash_admin_token(token);
    constant_time_eq(provided_hash.as_bytes(), expected_hash.as_bytes())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddCredentialBody {
    provider: ProviderKind,
    secret: SecretString,
    #[serde(default)]
    capacity_per_cycle: Option<u64>,
}

#[derive(Deserialize)]
struct ListCredentialsQuery {
    provider: Option<ProviderKind>,
}

#[derive(Deserialize)]
struct UpdateCredentialBody {
    disabled: bool,
}

#[derive(Deserialize)]
struct GrantBody {
    blocks: u64,
}

#[derive(Deserialize)]
struct UsageQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SummaryQuery {
    /// Look-back window ending now.
    hours: Option<u32>,
}

/// POST /admin/credentials
async fn handle_add_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AddCredentialBody>, JsonRejection>,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_request(format!("malformed request body: {}", e.body_text())),
    };
    if body.secret.expose_secret().trim().is_empty() {
        return bad_request("secret must not be empty");
    }
    if body.capacity_per_cycle == Some(0) {
        return bad_request("capacityPerCycle must be greater than zero");
    }

    match state
        .shotcaller
        .vault()
        .add_credential(body.provider, &body.secret, body.capacity_per_cycle)
    {
        Ok(summary) => (StatusCode::CREATED, Json(summary)).into_response(),
        Err(e) => internal_error(&e),
    }
}

/// GET /admin/credentials?provider=
async fn handle_list_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListCredentialsQuery>,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let credentials = state.shotcaller.vault().list(query.provider);
    Json(serde_json::json!({ "credentials": credentials })).into_response()
}

/// PATCH /admin/credentials/{id}
async fn handle_update_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<UpdateCredentialBody>, JsonRejection>,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_request(format!("malformed request body: {}", e.body_text())),
    };
    match state.shotcaller.vault().set_disabled(&id, body.disabled) {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => not_found("credential"),
        Err(e) => internal_error(&e),
    }
}

/// DELETE /admin/credentials/{id}
async fn handle_remove_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    match state.shotcaller.vault().remove_credential(&id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found("credential"),
        Err(e) => internal_error(&e),
    }
}

/// POST /admin/tenants/{id}/grant
async fn handle_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    body: Result<Json<GrantBody>, JsonRejection>,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_request(format!("malformed request body: {}", e.body_text())),
    };
    if body.blocks == 0 {
        return bad_request("blocks must be greater than zero");
    }
    match state.shotcaller.ledger().grant_blocks(&tenant_id, body.blocks) {
        Ok(balance) => Json(serde_json::json!({
            "tenantId": tenant_id,
            "remainingBalance": balance,
        }))
        .into_response(),
        Err(e) => internal_error(&e),
    }
}

/// GET /admin/tenants/{id}/usage?limit=
async fn handle_tenant_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_USAGE_LIMIT)
        .min(MAX_USAGE_LIMIT);
    match state.shotcaller.ledger().usage(&tenant_id, limit) {
        Ok(records) => Json(serde_json::json!({
            "tenantId": tenant_id,
            "usage": records,
        }))
        .into_response(),
        Err(e) => internal_error(&e),
    }
}

/// GET /admin/usage/summary?hours=
async fn handle_usage_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SummaryQuery>,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    let to = state.shotcaller.ledger().now();
    let from = to - ChronoDuration::hours(i64::from(query.hours.unwrap_or(24)));
    match state.shotcaller.ledger().usage_summary(from, to) {
        Ok(summary) => Json(serde_json::json!({
            "from": from,
            "to": to,
            "summary": summary,
        }))
        .into_response(),
        Err(e) => internal_error(&e),
    }
}
