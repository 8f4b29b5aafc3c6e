//! Security middleware: secure headers, CORS allow-list, CSRF double-submit
//! cookie, the global rate limit, and the auth tiers.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use vibesdk_core::ratelimit::RateLimitConfig;

use crate::AppState;

pub const CSRF_COOKIE: &str = "csrf-token";
pub const CSRF_HEADER: &str = "X-CSRF-Token";
const CSRF_TTL_SECS: i64 = 2 * 60 * 60;

// ── Secure headers ───────────────────────────────────────────────────────

/// Conservative response headers. Skipped for websocket upgrades, which
/// must not have their handshake rewritten.
pub async fn secure_headers(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let is_upgrade = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let mut response = next.run(request).await;
    if is_upgrade {
        return response;
    }

    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    let csp = if state.config.is_development() {
        // Dev tooling needs eval and websocket connections to the dev ports.
        "default-src 'self'; script-src 'self' 'unsafe-eval' 'unsafe-inline'; connect-src *"
    } else {
        "default-src 'self'; script-src 'self'; connect-src 'self'"
    };
    if let Ok(value) = HeaderValue::from_str(csp) {
        headers.insert("Content-Security-Policy", value);
    }
    response
}

// ── CORS ─────────────────────────────────────────────────────────────────

pub fn cors_layer(state: &AppState) -> CorsLayer {
    let mut origins: Vec<HeaderValue> = Vec::new();
    if !state.config.custom_domain.is_empty() {
        for scheme in ["https", "http"] {
            if let Ok(value) =
                HeaderValue::from_str(&format!("{scheme}://{}", state.config.custom_domain))
            {
                origins.push(value);
            }
        }
    }
    if state.config.is_development() {
        for port in [3000u16, 5173] {
            if let Ok(value) = HeaderValue::from_str(&format!("http://localhost:{port}")) {
                origins.push(value);
            }
            if let Ok(value) = HeaderValue::from_str(&format!("http://127.0.0.1:{port}")) {
                origins.push(value);
            }
        }
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-csrf-token"),
        ])
        .allow_credentials(true)
        .expose_headers([
            header::HeaderName::from_static("x-request-id"),
            header::HeaderName::from_static("x-ratelimit-remaining"),
        ])
}

// ── CSRF ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CsrfClaims {
    exp: i64,
}

pub fn mint_csrf_token(secret: &str) -> String {
    let claims = CsrfClaims {
        exp: chrono::Utc::now().timestamp() + CSRF_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap_or_default()
}

fn csrf_token_valid(secret: &str, token: &str) -> bool {
    decode::<CsrfClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .is_ok()
}

fn cookie_value(request: &Request, name: &str) -> Option<String> {
    let cookies = request.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn csrf_violation(reason: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": reason, "code": "CSRF_VIOLATION" })),
    )
        .into_response()
}

/// Double-submit cookie CSRF. Safe methods on `/api/*` that respond <400
/// get a fresh cookie when theirs is missing or stale; mutating methods
/// must present a matching, unexpired cookie + header pair.
pub async fn csrf(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let secret = state.config.jwt_secret.clone();
    let cookie = cookie_value(&request, CSRF_COOKIE);

    if matches!(method, Method::GET | Method::HEAD | Method::OPTIONS) {
        let needs_fresh = cookie
            .as_deref()
            .map(|token| !csrf_token_valid(&secret, token))
            .unwrap_or(true);
        let mut response = next.run(request).await;
        if needs_fresh && response.status().as_u16() < 400 {
            let token = mint_csrf_token(&secret);
            let value = format!("{CSRF_COOKIE}={token}; Path=/; SameSite=Strict; HttpOnly");
            if let Ok(header_value) = HeaderValue::from_str(&value) {
                response.headers_mut().append(header::SET_COOKIE, header_value);
            }
        }
        return response;
    }

    let header_token = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match (cookie, header_token) {
        (Some(cookie), Some(header)) if cookie == header => {
            if !csrf_token_valid(&secret, &cookie) {
                return csrf_violation("csrf token expired");
            }
            next.run(request).await
        }
        (Some(_), Some(_)) => csrf_violation("csrf token mismatch"),
        _ => csrf_violation("missing csrf token"),
    }
}

// ── Global rate limit ────────────────────────────────────────────────────

pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let identity = authenticated_user(&state, &request)
        .map(|claims| claims.sub)
        .or_else(|| {
            request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string());

    let mut config = RateLimitConfig::new(
        state.config.rate_limit_requests,
        state.config.rate_limit_period_s,
    );
    if state.config.rate_limit_burst > 0 {
        config = config.with_burst(state.config.rate_limit_burst);
    }
    let result = state.rate_limits.increment(&format!("global:{identity}"), &config);
    if !result.success {
        warn!(identity, "request rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limit exceeded", "code": "RATE_LIMITED" })),
        )
            .into_response();
    }

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&result.remaining_limit.to_string()) {
        response
            .headers_mut()
            .insert("X-RateLimit-Remaining", value);
    }
    response
}

// ── Auth ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: i64,
}

pub fn mint_session_token(secret: &str, user_id: &str, ttl_secs: i64) -> String {
    let claims = SessionClaims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap_or_default()
}

/// Bearer header first, session cookie second.
pub fn authenticated_user(state: &AppState, request: &Request) -> Option<SessionClaims> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| cookie_value(request, "session-token"));
    let token = token?;
    decode::<SessionClaims>(
        &token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "authentication required" })),
    )
        .into_response()
}

/// Authenticated tier: a valid session is required; the user id is stashed
/// in request extensions for handlers.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticated_user(&state, &request) {
        Some(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        None => unauthorized(),
    }
}

/// Owner-only tier: valid session plus ownership of the resource named by
/// the `agentId`/`id` path parameter.
pub async fn require_owner(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(claims) = authenticated_user(&state, &request) else {
        return unauthorized();
    };

    let path = request.uri().path().to_string();
    let resource_id = resource_id_from_path(&path);
    if let Some(resource_id) = resource_id {
        match state.app_service.is_owner(&resource_id, &claims.sub) {
            Ok(true) => {}
            Ok(false) => {
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "not the owner of this resource" })),
                )
                    .into_response()
            }
            Err(e) => {
                warn!("ownership check failed: {e:#}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "ownership check failed" })),
                )
                    .into_response();
            }
        }
    }
    request.extensions_mut().insert(claims);
    next.run(request).await
}

/// The path segment following `agents/` or `agent/` (routes name it
/// `:agentId` or `:id`).
fn resource_id_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "agents" || segment == "agent" || segment == "apps" {
            return segments.next().map(str::to_string);
        }
    }
    None
}

/// Body returned for anything outside the API surface.
pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub fn internal(e: impl std::fmt::Display) -> Response {
    warn!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}
