//! Axum router and all HTTP handlers for qk-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.
//!
//! Every handler runs the same admission sequence: extract caller IP,
//! consult the rate limiter (IP always, code scope when the request names a
//! code), and only then touch the ledger.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::error;

use qk_ledger::LedgerError;
use qk_ratelimit::Admission;

use crate::{
    api_types::{
        CodeActionRequest, CreateCodeRequest, CreateCodeResponse, ErrorResponse, HealthResponse,
        ListCodesResponse, LookupQuery, LookupResponse, OkResponse, RedeemRequest, RedeemResponse,
        ReserveRequest, ReserveResponse, ResetBindingResponse, SettleRequest, StatusQuery,
        StatusResponse,
    },
    state::AppState,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/redeem", post(redeem))
        .route("/v1/status", get(status_handler))
        .route("/v1/reserve", post(reserve))
        .route("/v1/commit", post(commit))
        .route("/v1/cancel", post(cancel))
        .route("/v1/admin/codes", post(admin_create_code).get(admin_list_codes))
        .route("/v1/admin/codes/lookup", get(admin_lookup_code))
        .route("/v1/admin/codes/revoke", post(admin_revoke_code))
        .route("/v1/admin/codes/reset-binding", post(admin_reset_binding))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// First hop of `x-forwarded-for`, or "unknown". The daemon is expected to
/// sit behind a proxy that sets the header; "unknown" callers share one
/// rate-limit bucket, which fails toward stricter limiting.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

fn error_body(status: StatusCode, body: ErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    error!(%err, "internal error");
    error_body(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorResponse::new("Internal server error"),
    )
}

/// Map ledger failures to HTTP. Client-caused failures carry the ledger's
/// own message; backend failures are logged and masked.
fn ledger_error(err: LedgerError) -> Response {
    let status = match &err {
        LedgerError::NotFound => StatusCode::NOT_FOUND,
        LedgerError::DeviceMismatch => StatusCode::FORBIDDEN,
        LedgerError::Revoked
        | LedgerError::Exhausted
        | LedgerError::NotActive
        | LedgerError::AlreadyCommitted
        | LedgerError::AlreadyCanceled => StatusCode::CONFLICT,
        LedgerError::InvalidQuota { .. } => StatusCode::BAD_REQUEST,
        LedgerError::Mint(_) | LedgerError::Store(_) | LedgerError::Internal(_) => {
            return internal_error(err);
        }
    };
    error_body(status, ErrorResponse::new(err.to_string()))
}

/// Rate-limit gate: IP scope always, code scope when known.
async fn admit(st: &AppState, headers: &HeaderMap, code: Option<&str>) -> Result<(), Response> {
    let ip = client_ip(headers);
    match st.limits.check(&ip, code).await {
        Ok(Admission::Allowed) => Ok(()),
        Ok(Admission::Limited { retry_after }) => Err(error_body(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorResponse {
                ok: false,
                error: "Rate limit exceeded".to_string(),
                retry_after: Some(retry_after.as_secs().max(1)),
            },
        )),
        Err(e) => Err(internal_error(e)),
    }
}

/// Admin gate: `x-admin-secret` header must match the configured secret.
/// An unset secret refuses with 500 — the gate never falls open.
fn require_admin(st: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = st.admin_secret.as_deref() else {
        return Err(error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new("admin secret not configured on server"),
        ));
    };
    match headers.get("x-admin-secret").and_then(|v| v.to_str().ok()) {
        Some(got) if got == expected => Ok(()),
        _ => Err(error_body(
            StatusCode::UNAUTHORIZED,
            ErrorResponse::new("Unauthorized"),
        )),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/redeem
// ---------------------------------------------------------------------------

pub(crate) async fn redeem(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RedeemRequest>,
) -> Response {
    let code = qk_codes::normalize(&req.code);
    if let Err(resp) = admit(&st, &headers, Some(&code)).await {
        return resp;
    }
    match st.ledger.redeem(&code, &req.device_id).await {
        Ok(view) => (
            StatusCode::OK,
            Json(RedeemResponse {
                ok: true,
                remaining: view.remaining,
                quota_total: view.quota_total,
            }),
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<StatusQuery>,
) -> Response {
    let code = qk_codes::normalize(&q.code);
    if let Err(resp) = admit(&st, &headers, Some(&code)).await {
        return resp;
    }
    match st.ledger.status(&code, &q.device_id).await {
        Ok(view) => (
            StatusCode::OK,
            Json(StatusResponse {
                ok: true,
                remaining: view.remaining,
                quota_total: view.quota_total,
                status: view.status,
            }),
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/reserve
// ---------------------------------------------------------------------------

pub(crate) async fn reserve(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReserveRequest>,
) -> Response {
    let code = qk_codes::normalize(&req.code);
    if let Err(resp) = admit(&st, &headers, Some(&code)).await {
        return resp;
    }
    match st.ledger.reserve(&code, &req.device_id).await {
        Ok(unit) => (
            StatusCode::OK,
            Json(ReserveResponse {
                ok: true,
                reservation_id: unit.reservation_id,
                remaining: unit.remaining,
            }),
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/commit  POST /v1/cancel
// ---------------------------------------------------------------------------

// Settle requests carry only a reservation id, so they rate-limit on the IP
// scope alone.

pub(crate) async fn commit(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SettleRequest>,
) -> Response {
    if let Err(resp) = admit(&st, &headers, None).await {
        return resp;
    }
    match st.ledger.commit(&req.reservation_id).await {
        Ok(()) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => ledger_error(e),
    }
}

pub(crate) async fn cancel(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SettleRequest>,
) -> Response {
    if let Err(resp) = admit(&st, &headers, None).await {
        return resp;
    }
    match st.ledger.cancel(&req.reservation_id).await {
        Ok(()) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => ledger_error(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/admin/codes
// ---------------------------------------------------------------------------

pub(crate) async fn admin_create_code(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateCodeRequest>,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    if let Err(resp) = admit(&st, &headers, None).await {
        return resp;
    }
    match st.ledger.activate(req.quota_total, req.note).await {
        Ok(minted) => {
            let url = format!("{}/redeem?code={}", st.base_url, minted.code);
            (
                StatusCode::OK,
                Json(CreateCodeResponse {
                    ok: true,
                    code: minted.code,
                    quota_total: minted.quota_total,
                    url,
                }),
            )
                .into_response()
        }
        Err(e) => ledger_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/admin/codes
// ---------------------------------------------------------------------------

pub(crate) async fn admin_list_codes(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    if let Err(resp) = admit(&st, &headers, None).await {
        return resp;
    }
    match st.ledger.list_codes().await {
        Ok(codes) => (StatusCode::OK, Json(ListCodesResponse { ok: true, codes })).into_response(),
        Err(e) => ledger_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/admin/codes/lookup
// ---------------------------------------------------------------------------

pub(crate) async fn admin_lookup_code(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<LookupQuery>,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    if let Err(resp) = admit(&st, &headers, None).await {
        return resp;
    }

    let code = qk_codes::normalize(&q.code);
    let record = match st.ledger.store().fetch_code(&code).await {
        Ok(Some(rec)) => rec,
        Ok(None) => return ledger_error(LedgerError::NotFound),
        Err(e) => return internal_error(e),
    };
    let history = match st.ledger.history(&code).await {
        Ok(h) => h,
        Err(e) => return ledger_error(e),
    };

    (
        StatusCode::OK,
        Json(LookupResponse {
            ok: true,
            code,
            quota_total: record.quota_total,
            used: record.used,
            remaining: record.remaining(),
            status: record.status,
            created_at: record.created_at,
            bound_device_hash: record.bound_device_hash,
            bind_reset_count: record.bind_reset_count,
            bind_reset_at: record.bind_reset_at,
            note: record.note,
            history,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/admin/codes/revoke
// ---------------------------------------------------------------------------

pub(crate) async fn admin_revoke_code(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CodeActionRequest>,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    if let Err(resp) = admit(&st, &headers, None).await {
        return resp;
    }
    let code = qk_codes::normalize(&req.code);
    match st.ledger.revoke(&code).await {
        Ok(()) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => ledger_error(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/admin/codes/reset-binding
// ---------------------------------------------------------------------------

pub(crate) async fn admin_reset_binding(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CodeActionRequest>,
) -> Response {
    if let Err(resp) = require_admin(&st, &headers) {
        return resp;
    }
    if let Err(resp) = admit(&st, &headers, None).await {
        return resp;
    }
    let code = qk_codes::normalize(&req.code);
    match st.ledger.reset_binding(&code).await {
        Ok(count) => (
            StatusCode::OK,
            Json(ResetBindingResponse {
                ok: true,
                bind_reset_count: count,
            }),
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}
