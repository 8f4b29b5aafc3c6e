//! HTTP API handlers mounted under `/api/*`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use vibesdk_agent::agent::InitArgs;
use vibesdk_agent::github::GithubExportRequest;
use vibesdk_agent::operations::UserImage;
use vibesdk_agent::screenshot::Viewport;
use vibesdk_core::ids::short_id;
use vibesdk_core::templates;
use vibesdk_core::types::BehaviorKind;

use crate::middleware::{internal, mint_csrf_token, mint_session_token, SessionClaims, CSRF_COOKIE};
use crate::AppState;

const SESSION_TTL_SECS: i64 = 7 * 24 * 60 * 60;

// ── Request bodies ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct LoginBody {
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateAgentBody {
    pub query: String,
    pub template_name: Option<String>,
    #[serde(default)]
    pub behavior: Option<BehaviorKind>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserRequestBody {
    pub text: String,
    #[serde(default)]
    pub images: Vec<UserImage>,
}

#[derive(Deserialize)]
pub(crate) struct ConversationBody {
    pub message: String,
}

#[derive(Deserialize)]
pub(crate) struct DeepDebugBody {
    #[serde(default)]
    pub focus: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProjectNameBody {
    pub project_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegenerateFileBody {
    pub path: String,
    #[serde(default)]
    pub retry_index: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GithubExportBody {
    pub repo_url: String,
    pub token: String,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScreenshotBody {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

// ── Auth ─────────────────────────────────────────────────────────────────

/// Dev credential mint: upsert the user and issue session + fresh CSRF
/// cookies (the CSRF token rotates on every auth change).
pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Response {
    let user_id = format!("user-{}", short_id(10));
    if let Err(e) = state.app_service.upsert_user(&user_id, &body.email, &body.name) {
        return internal(e);
    }
    let session = mint_session_token(&state.config.jwt_secret, &user_id, SESSION_TTL_SECS);
    let csrf = mint_csrf_token(&state.config.jwt_secret);

    let mut response = Json(json!({ "userId": user_id, "token": session })).into_response();
    let cookies = [
        format!("session-token={session}; Path=/; SameSite=Strict; HttpOnly"),
        format!("{CSRF_COOKIE}={csrf}; Path=/; SameSite=Strict; HttpOnly"),
    ];
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

// ── Agents ───────────────────────────────────────────────────────────────

pub(crate) async fn create_agent(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<SessionClaims>,
    Json(body): Json<CreateAgentBody>,
) -> Response {
    let agent_id = short_id(12);
    let agent = match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => agent,
        Err(e) => return internal(e),
    };

    let blueprint = match agent
        .initialize(InitArgs {
            query: body.query,
            user_id: claims.sub,
            host_name: state.config.host.clone(),
            template_name: body.template_name,
            behavior: body.behavior.unwrap_or_default(),
        })
        .await
    {
        Ok(blueprint) => blueprint,
        Err(e) => return internal(e),
    };

    info!(agent_id, "agent created");
    agent.generate_all_files().await;
    (
        StatusCode::CREATED,
        Json(json!({ "agentId": agent_id, "blueprint": blueprint })),
    )
        .into_response()
}

pub(crate) async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => Json(agent.get_full_state().await).into_response(),
        Err(e) => internal(e),
    }
}

pub(crate) async fn queue_request(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<UserRequestBody>,
) -> Response {
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => {
            agent.queue_user_request(&body.text, body.images).await;
            agent.generate_all_files().await;
            (StatusCode::ACCEPTED, Json(json!({ "queued": true }))).into_response()
        }
        Err(e) => internal(e),
    }
}

pub(crate) async fn cancel_generation(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state.agents.get(&agent_id).await {
        Some(agent) => {
            agent.cancel_current_inference();
            Json(json!({ "cancelled": true })).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

pub(crate) async fn conversation_message(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<ConversationBody>,
) -> Response {
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => match agent.process_conversation_message(&body.message).await {
            Ok(response) => Json(json!({ "response": response })).into_response(),
            Err(e) => internal(e),
        },
        Err(e) => internal(e),
    }
}

pub(crate) async fn clear_conversation(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => match agent.clear_conversation().await {
            Ok(()) => Json(json!({ "cleared": true })).into_response(),
            Err(e) => internal(e),
        },
        Err(e) => internal(e),
    }
}

pub(crate) async fn deep_debug(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<DeepDebugBody>,
) -> Response {
    let focus = if body.focus.is_empty() {
        "Investigate and fix the current runtime and typecheck issues".to_string()
    } else {
        body.focus
    };
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => match agent.deep_debug(focus).await {
            Ok(conversation_id) => {
                (StatusCode::ACCEPTED, Json(json!({ "conversationId": conversation_id })))
                    .into_response()
            }
            Err(e) => (
                StatusCode::CONFLICT,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response(),
        },
        Err(e) => internal(e),
    }
}

pub(crate) async fn update_blueprint(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(patch): Json<Value>,
) -> Response {
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => match agent.update_blueprint(&patch).await {
            Ok(blueprint) => Json(json!({ "blueprint": blueprint })).into_response(),
            Err(e) => internal(e),
        },
        Err(e) => internal(e),
    }
}

pub(crate) async fn update_project_name(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<ProjectNameBody>,
) -> Response {
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => match agent.update_project_name(&body.project_name).await {
            Ok(()) => Json(json!({ "projectName": body.project_name })).into_response(),
            Err(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response(),
        },
        Err(e) => internal(e),
    }
}

pub(crate) async fn regenerate_file(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<RegenerateFileBody>,
) -> Response {
    match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => match agent.regenerate_file(&body.path, body.retry_index).await {
            Ok(file) => Json(json!({ "path": file.file_path, "diff": file.last_diff })).into_response(),
            Err(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response(),
        },
        Err(e) => internal(e),
    }
}

pub(crate) async fn wait_for_preview(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Response {
    let agent = match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => agent,
        Err(e) => return internal(e),
    };
    let Some(deployment) = agent.deployment() else {
        return (StatusCode::CONFLICT, Json(json!({ "error": "agent has no deployment" })))
            .into_response();
    };
    match deployment.wait_for_preview().await {
        Ok(url) => Json(json!({ "previewUrl": url })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

/// Production deployment is a stub for the local backend; the deployment
/// row is still recorded when a preview exists.
pub(crate) async fn deploy(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Response {
    let agent = match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => agent,
        Err(e) => return internal(e),
    };
    let Some(deployment) = agent.deployment() else {
        return (StatusCode::CONFLICT, Json(json!({ "error": "agent has no deployment" })))
            .into_response();
    };
    let hook = vibesdk_core::deploy::noop_hook();
    if let Err(e) = deployment.deploy_to_cloudflare(&hook).await {
        return internal(e);
    }
    let preview = deployment.preview_url().await;
    if let Some(ref url) = preview {
        if let Err(e) = state
            .app_service
            .record_deployment(&format!("deploy-{}", short_id(10)), &agent_id, url)
        {
            return internal(e);
        }
    }
    Json(json!({ "deployed": preview.is_some(), "url": preview })).into_response()
}

// ── GitHub export ────────────────────────────────────────────────────────

pub(crate) async fn github_export(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<GithubExportBody>,
) -> Response {
    let agent = match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => agent,
        Err(e) => return internal(e),
    };
    let request = GithubExportRequest {
        repo_url: body.repo_url,
        token: body.token,
        default_branch: body.branch.unwrap_or_else(|| "main".to_string()),
        author_name: vibesdk_core::workspace::DEFAULT_AUTHOR_NAME.to_string(),
        author_email: vibesdk_core::workspace::DEFAULT_AUTHOR_EMAIL.to_string(),
    };
    match agent
        .export_to_github(&state.config.github_api_url, request)
        .await
    {
        Ok(result) => Json(json!({
            "commitsPushed": result.commits_pushed,
            "blobsCreated": result.blobs_created,
            "branch": result.branch,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

// ── Screenshot ───────────────────────────────────────────────────────────

pub(crate) async fn capture_screenshot(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<ScreenshotBody>,
) -> Response {
    let agent = match state.agents.get_or_create(&agent_id).await {
        Ok(agent) => agent,
        Err(e) => return internal(e),
    };
    let mut viewport = Viewport::default();
    if let Some(width) = body.width {
        viewport.width = width;
    }
    if let Some(height) = body.height {
        viewport.height = height;
    }
    match agent.capture_screenshot(&state.screenshots, viewport).await {
        Ok(url) => Json(json!({ "screenshotUrl": url })).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

// ── Apps / templates ─────────────────────────────────────────────────────

pub(crate) async fn list_apps(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<SessionClaims>,
) -> Response {
    match state.app_service.list_apps_for_user(&claims.sub) {
        Ok(apps) => Json(json!({ "apps": apps })).into_response(),
        Err(e) => internal(e),
    }
}

pub(crate) async fn list_templates(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "templates": templates::list_templates(&state.config.data_dir) })).into_response()
}

pub(crate) async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}
