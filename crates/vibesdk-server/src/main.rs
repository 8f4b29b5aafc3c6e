use std::sync::Arc;

use tracing::info;

use vibesdk_agent::inference::HttpInferenceClient;
use vibesdk_agent::manager::AgentManager;
use vibesdk_agent::screenshot::ScreenshotService;
use vibesdk_core::config::Config;
use vibesdk_core::db::{AppService, Db};
use vibesdk_core::ratelimit::RateLimitStore;
use vibesdk_server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "vibesdk_server=info,vibesdk_core=info,vibesdk_agent=info,tower_http=warn".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(&config.data_dir)?;

    let app_db = Arc::new(Db::open(&format!("{}/app.db", config.data_dir))?);
    app_db.migrate_app()?;
    let app_service = AppService::new(app_db);

    let inference = Arc::new(HttpInferenceClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
    ));
    let agents = AgentManager::new(Arc::clone(&config), app_service.clone(), inference);
    let screenshots = ScreenshotService::new(config.screenshot_api_url.clone(), app_service.clone());

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        app_service,
        agents,
        rate_limits: RateLimitStore::new(),
        screenshots,
    });
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "vibesdk server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
