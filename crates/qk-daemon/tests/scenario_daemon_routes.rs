//! In-process scenario tests for qk-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot` — no network I/O required.

use std::{sync::Arc, time::Duration};

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use qk_daemon::{routes, state::AppState};
use qk_ledger::LedgerConfig;
use qk_ratelimit::RateLimitConfig;
use qk_store::MemoryStore;
use tower::ServiceExt; // oneshot

const ADMIN_SECRET: &str = "test-admin-secret";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a fresh in-process router backed by a clean store, with the admin
/// secret configured and generous rate limits.
fn make_router() -> axum::Router {
    make_router_with(Some(ADMIN_SECRET.to_string()), RateLimitConfig::default())
}

fn make_router_with(admin_secret: Option<String>, limits: RateLimitConfig) -> axum::Router {
    let store = Arc::new(MemoryStore::new());
    let st = Arc::new(AppState::new(
        store,
        LedgerConfig::default(),
        limits,
        admin_secret,
        "http://localhost:8977".to_string(),
    ));
    routes::build_router(st)
}

/// Drive the router with a single request and return (status, body_bytes).
async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

/// Parse body bytes as a `serde_json::Value`.
fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn admin_get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-admin-secret", ADMIN_SECRET)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn admin_post_json(uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-admin-secret", ADMIN_SECRET)
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

/// Mint a code through the admin route and return it.
async fn create_code(router: &axum::Router, quota_total: u32) -> String {
    let (status, body) = call(
        router.clone(),
        admin_post_json(
            "/v1/admin/codes",
            serde_json::json!({ "quotaTotal": quota_total }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    json["code"].as_str().expect("code field").to_string()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let router = make_router();
    let (status, body) = call(router, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "qk-daemon");
}

// ---------------------------------------------------------------------------
// Admin auth gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_routes_refuse_missing_or_wrong_secret() {
    let router = make_router();

    // No header at all.
    let (status, body) = call(router.clone(), get("/v1/admin/codes")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(parse_json(body)["ok"], false);

    // Wrong header value.
    let req = Request::builder()
        .method("GET")
        .uri("/v1/admin/codes")
        .header("x-admin-secret", "not-the-secret")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_refuse_when_secret_is_unset_on_server() {
    // No secret configured: the gate fails closed with 500, even with a
    // header supplied; an unset secret must never mean "allow everyone".
    let router = make_router_with(None, RateLimitConfig::default());
    let (status, _) = call(router, admin_get("/v1/admin/codes")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

// ---------------------------------------------------------------------------
// POST /v1/admin/codes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_code_returns_formatted_code_and_redeem_url() {
    let router = make_router();
    let (status, body) = call(
        router,
        admin_post_json("/v1/admin/codes", serde_json::json!({ "quotaTotal": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["quotaTotal"], 5);
    let code = json["code"].as_str().expect("code field");
    assert_eq!(code.len(), 9);
    assert_eq!(&code[4..5], "-");
    let url = json["url"].as_str().expect("url field");
    assert!(url.contains(code));
}

#[tokio::test]
async fn create_code_rejects_out_of_range_quota() {
    let router = make_router();
    for quota in [0u32, 10_000] {
        let (status, _) = call(
            router.clone(),
            admin_post_json("/v1/admin/codes", serde_json::json!({ "quotaTotal": quota })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "quota {quota}");
    }
}

// ---------------------------------------------------------------------------
// POST /v1/redeem  GET /v1/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redeem_binds_and_reports_quota() {
    let router = make_router();
    let code = create_code(&router, 3).await;

    let (status, body) = call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["remaining"], 3);
    assert_eq!(json["quotaTotal"], 3);

    // Same device again: idempotent.
    let (status, _) = call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        router,
        get(&format!("/v1/status?code={code}&deviceId=device-a")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["remaining"], 3);
    assert_eq!(json["status"], "active");
}

#[tokio::test]
async fn redeem_accepts_lowercase_and_unhyphenated_input() {
    let router = make_router();
    let code = create_code(&router, 2).await;

    let sloppy = code.replace('-', "").to_lowercase();
    let (status, _) = call(
        router,
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": sloppy, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn redeem_rejects_non_ascii_code_without_panicking() {
    // Cleaned form is 8 bytes but not 8 ASCII symbols; normalization must
    // pass it through and lookup must miss, never split mid-character.
    let router = make_router();
    let (status, _) = call(
        router,
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": "ab\u{263A}\u{263A}", "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn redeem_maps_ledger_failures_to_http() {
    let router = make_router();
    let code = create_code(&router, 2).await;

    // Unknown code.
    let (status, _) = call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": "ZZZZ-ZZZZ", "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Bind, then another device: 403.
    let (status, _) = call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-b" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(parse_json(body)["ok"], false);

    // Revoked: 409.
    call(
        router.clone(),
        admin_post_json("/v1/admin/codes/revoke", serde_json::json!({ "code": code })),
    )
    .await;
    let (status, _) = call(
        router,
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ---------------------------------------------------------------------------
// Reserve / commit / cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reserve_commit_consumes_one_unit() {
    let router = make_router();
    let code = create_code(&router, 2).await;

    call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;

    let (status, body) = call(
        router.clone(),
        post_json(
            "/v1/reserve",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["remaining"], 1);
    let rid = json["reservationId"].as_str().expect("reservationId").to_string();

    let (status, _) = call(
        router.clone(),
        post_json("/v1/commit", serde_json::json!({ "reservationId": rid })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Committing again is idempotent; canceling after commit is a conflict.
    let (status, _) = call(
        router.clone(),
        post_json("/v1/commit", serde_json::json!({ "reservationId": rid })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        router.clone(),
        post_json("/v1/cancel", serde_json::json!({ "reservationId": rid })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(
        router,
        get(&format!("/v1/status?code={code}&deviceId=device-a")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["remaining"], 1);
}

#[tokio::test]
async fn reserve_cancel_returns_the_unit() {
    let router = make_router();
    let code = create_code(&router, 1).await;

    call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;

    let (status, body) = call(
        router.clone(),
        post_json(
            "/v1/reserve",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rid = parse_json(body)["reservationId"]
        .as_str()
        .expect("reservationId")
        .to_string();

    // Quota of one, fully reserved: a second reserve conflicts.
    let (status, _) = call(
        router.clone(),
        post_json(
            "/v1/reserve",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        router.clone(),
        post_json("/v1/cancel", serde_json::json!({ "reservationId": rid })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        router,
        get(&format!("/v1/status?code={code}&deviceId=device-a")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["remaining"], 1);
    assert_eq!(json["status"], "active");
}

#[tokio::test]
async fn settle_of_a_vanished_reservation_is_200() {
    // An expired lease purges the reservation and the reconciler rolls the
    // unit back; a late commit or cancel is acknowledged, not failed.
    let router = make_router();
    let (status, _) = call(
        router.clone(),
        post_json("/v1/commit", serde_json::json!({ "reservationId": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        router,
        post_json("/v1/cancel", serde_json::json!({ "reservationId": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Admin list / lookup / reset-binding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lookup_shows_full_record_and_history() {
    let router = make_router();
    let code = create_code(&router, 2).await;

    call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    let (_, body) = call(
        router.clone(),
        post_json(
            "/v1/reserve",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;
    let rid = parse_json(body)["reservationId"]
        .as_str()
        .expect("reservationId")
        .to_string();
    call(
        router.clone(),
        post_json("/v1/commit", serde_json::json!({ "reservationId": rid })),
    )
    .await;

    let (status, body) = call(
        router.clone(),
        admin_get(&format!("/v1/admin/codes/lookup?code={code}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["code"], code);
    assert_eq!(json["used"], 1);
    assert_eq!(json["remaining"], 1);
    assert!(json["boundDeviceHash"].is_string());
    assert_eq!(json["history"][0]["outcome"], "committed");

    // Listing masks the code tail.
    let (status, body) = call(router, admin_get("/v1/admin/codes")).await;
    assert_eq!(status, StatusCode::OK);
    let listed = parse_json(body)["codes"][0]["code"]
        .as_str()
        .expect("masked code")
        .to_string();
    assert!(listed.ends_with("-****"));
    assert_eq!(&listed[..4], &code[..4]);
}

#[tokio::test]
async fn reset_binding_lets_a_new_device_bind() {
    let router = make_router();
    let code = create_code(&router, 2).await;

    call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-a" }),
        ),
    )
    .await;

    let (status, body) = call(
        router.clone(),
        admin_post_json(
            "/v1/admin/codes/reset-binding",
            serde_json::json!({ "code": code }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["bindResetCount"], 1);

    let (status, _) = call(
        router,
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": code, "deviceId": "device-b" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ip_ceiling_returns_429_with_retry_after() {
    let limits = RateLimitConfig {
        window: Duration::from_secs(60),
        ip_limit: 2,
        code_limit: 100,
    };
    let router = make_router_with(Some(ADMIN_SECRET.to_string()), limits);

    for _ in 0..2 {
        let (status, _) = call(
            router.clone(),
            post_json(
                "/v1/redeem",
                serde_json::json!({ "code": "ZZZZ-ZZZZ", "deviceId": "d" }),
            ),
        )
        .await;
        // Unknown code, but the request was admitted.
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let (status, body) = call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": "ZZZZ-ZZZZ", "deviceId": "d" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let json = parse_json(body);
    assert_eq!(json["ok"], false);
    assert!(json["retryAfter"].as_u64().expect("retryAfter") >= 1);
}

#[tokio::test]
async fn distinct_forwarded_ips_get_distinct_buckets() {
    let limits = RateLimitConfig {
        window: Duration::from_secs(60),
        ip_limit: 1,
        code_limit: 100,
    };
    let router = make_router_with(Some(ADMIN_SECRET.to_string()), limits);

    for ip in ["10.0.0.1", "10.0.0.2"] {
        let req = Request::builder()
            .method("POST")
            .uri("/v1/redeem")
            .header("content-type", "application/json")
            .header("x-forwarded-for", ip)
            .body(axum::body::Body::from(
                serde_json::json!({ "code": "ZZZZ-ZZZZ", "deviceId": "d" }).to_string(),
            ))
            .unwrap();
        let (status, _) = call(router.clone(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "ip {ip} should be admitted");
    }

    // Requests without the header share the "unknown" bucket.
    let (status, _) = call(
        router.clone(),
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": "ZZZZ-ZZZZ", "deviceId": "d" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(
        router,
        post_json(
            "/v1/redeem",
            serde_json::json!({ "code": "ZZZZ-ZZZZ", "deviceId": "d" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}
