//! Screenshot capture: ask the external rendering service for a PNG of the
//! preview URL and persist the pointer through the AppService.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::warn;

use vibesdk_core::db::AppService;

use crate::agent::CodeGenAgent;
use crate::websocket::WsMessageType;

/// Page-load budget passed to the renderer.
const GOTO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1280, height: 800 }
    }
}

pub struct ScreenshotService {
    api_url: String,
    client: reqwest::Client,
    app_service: AppService,
}

impl ScreenshotService {
    pub fn new(api_url: impl Into<String>, app_service: AppService) -> Self {
        Self {
            api_url: api_url.into(),
            client: reqwest::Client::new(),
            app_service,
        }
    }

    /// POST URL + viewport to the renderer, store the returned PNG as a
    /// data URL on the app record, and return the stored pointer.
    pub async fn capture_and_store(
        &self,
        app_id: &str,
        preview_url: &str,
        viewport: Viewport,
    ) -> Result<String> {
        if self.api_url.is_empty() {
            return Err(anyhow!("screenshot api is not configured"));
        }
        let body = json!({
            "url": preview_url,
            "viewport": { "width": viewport.width, "height": viewport.height },
            "gotoTimeoutMs": GOTO_TIMEOUT.as_millis() as u64,
        });
        let response = self
            .client
            .post(&self.api_url)
            .json(&body)
            .timeout(GOTO_TIMEOUT + Duration::from_secs(5))
            .send()
            .await
            .context("screenshot request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("screenshot api returned {status}"));
        }
        let parsed: Value = response.json().await.context("parse screenshot response")?;
        let base64_png = parsed
            .get("screenshot")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("screenshot response had no image"))?;

        let data_url = format!("data:image/png;base64,{base64_png}");
        self.app_service.update_app_screenshot(app_id, &data_url)?;
        Ok(data_url)
    }
}

impl CodeGenAgent {
    /// Capture a screenshot of the current preview, broadcasting progress.
    pub async fn capture_screenshot(
        self: &Arc<Self>,
        service: &ScreenshotService,
        viewport: Viewport,
    ) -> Result<String> {
        let preview_url = match self.deployment() {
            Some(deployment) => deployment
                .preview_url()
                .await
                .ok_or_else(|| anyhow!("no preview deployed"))?,
            None => return Err(anyhow!("no deployment for agent")),
        };

        self.hub().broadcast(
            WsMessageType::ScreenshotCaptureStarted,
            json!({ "previewUrl": preview_url }),
        );
        match service
            .capture_and_store(self.agent_id(), &preview_url, viewport)
            .await
        {
            Ok(url) => {
                self.hub().broadcast(
                    WsMessageType::ScreenshotCaptureSuccess,
                    json!({ "screenshotUrl": url }),
                );
                Ok(url)
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id(), "screenshot capture failed: {e:#}");
                self.hub().broadcast(
                    WsMessageType::ScreenshotCaptureError,
                    json!({ "message": format!("{e:#}") }),
                );
                Err(e)
            }
        }
    }
}
