pub mod middleware;
mod routes;
mod ws;

use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};

use vibesdk_agent::manager::AgentManager;
use vibesdk_agent::screenshot::ScreenshotService;
use vibesdk_core::config::Config;
use vibesdk_core::db::AppService;
use vibesdk_core::ratelimit::RateLimitStore;

pub struct AppState {
    pub config: Arc<Config>,
    pub app_service: AppService,
    pub agents: AgentManager,
    pub rate_limits: RateLimitStore,
    pub screenshots: ScreenshotService,
}

/// Assemble the `/api` router with the middleware chain, outer → inner:
/// secure headers → CORS → CSRF → global rate limit → auth.
pub fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/auth/login", post(routes::login))
        .route("/api/templates", get(routes::list_templates));

    let authenticated = Router::new()
        .route("/api/agents", post(routes::create_agent))
        .route("/api/apps", get(routes::list_apps))
        .layer(from_fn_with_state(Arc::clone(&state), middleware::require_auth));

    let owner_only = Router::new()
        .route("/api/agents/:agentId", get(routes::get_agent))
        .route("/api/agents/:agentId/request", post(routes::queue_request))
        .route("/api/agents/:agentId/cancel", post(routes::cancel_generation))
        .route(
            "/api/agents/:agentId/conversation",
            post(routes::conversation_message).delete(routes::clear_conversation),
        )
        .route("/api/agents/:agentId/deep-debug", post(routes::deep_debug))
        .route("/api/agents/:agentId/blueprint", post(routes::update_blueprint))
        .route("/api/agents/:agentId/project-name", put(routes::update_project_name))
        .route("/api/agents/:agentId/files/regenerate", post(routes::regenerate_file))
        .route("/api/agents/:agentId/preview", get(routes::wait_for_preview))
        .route("/api/agents/:agentId/deploy", post(routes::deploy))
        .route("/api/agents/:agentId/github-export", post(routes::github_export))
        .route("/api/agents/:agentId/screenshot", post(routes::capture_screenshot))
        .route("/api/agent/:agentId/ws", get(ws::upgrade))
        .layer(from_fn_with_state(Arc::clone(&state), middleware::require_owner));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .merge(owner_only)
        .fallback(middleware::not_found)
        .layer(from_fn_with_state(Arc::clone(&state), middleware::rate_limit))
        .layer(from_fn_with_state(Arc::clone(&state), middleware::csrf))
        .layer(middleware::cors_layer(&state))
        .layer(from_fn_with_state(Arc::clone(&state), middleware::secure_headers))
        .with_state(state)
}
