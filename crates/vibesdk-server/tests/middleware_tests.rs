//! Boundary tests for the security middleware chain.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use vibesdk_agent::inference::{InferenceClient, InferenceRequest};
use vibesdk_agent::manager::AgentManager;
use vibesdk_agent::screenshot::ScreenshotService;
use vibesdk_core::config::Config;
use vibesdk_core::db::{AppService, Db};
use vibesdk_core::ratelimit::RateLimitStore;
use vibesdk_server::middleware::{mint_csrf_token, mint_session_token};
use vibesdk_server::{build_router, AppState};

struct StubInference;

#[async_trait]
impl InferenceClient for StubInference {
    async fn infer(&self, _request: InferenceRequest, _abort: &CancellationToken) -> Result<String> {
        Ok("{}".to_string())
    }
}

fn test_state(data_dir: &str, rate_limit: u32) -> Arc<AppState> {
    let config = Arc::new(Config {
        host: "127.0.0.1".into(),
        port: 0,
        custom_domain: String::new(),
        node_env: "test".into(),
        data_dir: data_dir.to_string(),
        jwt_secret: "test-secret".into(),
        llm_base_url: String::new(),
        llm_api_key: String::new(),
        model: "test-model".into(),
        max_phases: 12,
        fast_smart_fixes: false,
        sandbox_bootstrap_timeout_s: 30,
        rate_limit_requests: rate_limit,
        rate_limit_period_s: 60,
        rate_limit_burst: 0,
        screenshot_api_url: String::new(),
        github_api_url: String::new(),
    });
    let db = Arc::new(Db::open(&format!("{data_dir}/app.db")).expect("open app db"));
    db.migrate_app().expect("migrate");
    let app_service = AppService::new(db);
    let agents = AgentManager::new(Arc::clone(&config), app_service.clone(), Arc::new(StubInference));
    let screenshots = ScreenshotService::new(String::new(), app_service.clone());
    Arc::new(AppState {
        config,
        app_service,
        agents,
        rate_limits: RateLimitStore::new(),
        screenshots,
    })
}

fn router(state: &Arc<AppState>) -> Router {
    build_router(Arc::clone(state))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn post_without_csrf_token_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 100);

    let response = router(&state)
        .oneshot(
            Request::post("/api/anything")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["code"], "CSRF_VIOLATION");
}

#[tokio::test]
async fn safe_requests_receive_a_fresh_csrf_cookie() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 100);

    let response = router(&state)
        .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("csrf cookie issued");
    assert!(cookie.starts_with("csrf-token="));
}

#[tokio::test]
async fn matching_csrf_pair_passes_through_to_auth() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 100);
    let token = mint_csrf_token("test-secret");

    let response = router(&state)
        .oneshot(
            Request::post("/api/agents")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::COOKIE, format!("csrf-token={token}"))
                .header("X-CSRF-Token", token.clone())
                .body(Body::from(r#"{"query": "x"}"#))
                .expect("request"),
        )
        .await
        .expect("response");

    // CSRF passed; the authenticated tier rejects the anonymous caller.
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mismatched_csrf_pair_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 100);
    let token = mint_csrf_token("test-secret");

    let response = router(&state)
        .oneshot(
            Request::post("/api/agents")
                .header(header::COOKIE, format!("csrf-token={token}"))
                .header("X-CSRF-Token", format!("{token}tampered"))
                .body(Body::from("{}"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["code"], "CSRF_VIOLATION");
}

#[tokio::test]
async fn unknown_paths_return_plain_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 100);

    let response = router(&state)
        .oneshot(Request::get("/nowhere").body(Body::empty()).expect("request"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    assert_eq!(&bytes[..], b"Not Found");
}

#[tokio::test]
async fn global_rate_limit_trips_and_reports_remaining() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 2);

    let first = router(&state)
        .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first.headers().get("X-RateLimit-Remaining").and_then(|v| v.to_str().ok()),
        Some("1")
    );

    let second = router(&state)
        .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::OK);

    let third = router(&state)
        .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn owner_tier_rejects_non_owners() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 100);
    state
        .app_service
        .upsert_user("owner-1", "owner@example.com", "Owner")
        .expect("user");
    state
        .app_service
        .create_app("agent-xyz", "owner-1", "App", "", "app-1", "react")
        .expect("app");

    let session = mint_session_token("test-secret", "intruder", 3600);
    let response = router(&state)
        .oneshot(
            Request::get("/api/agents/agent-xyz")
                .header(header::AUTHORIZATION, format!("Bearer {session}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn secure_headers_are_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir.path().to_string_lossy(), 100);

    let response = router(&state)
        .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");

    assert_eq!(
        response.headers().get("X-Content-Type-Options").and_then(|v| v.to_str().ok()),
        Some("nosniff")
    );
    assert!(response.headers().contains_key("Content-Security-Policy"));
}
