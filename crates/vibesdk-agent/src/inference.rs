//! Inference layer: the opaque LLM call. A request either resolves to a
//! final string or streams chunks through an `on_chunk` channel; both paths
//! honor the agent-wide cancellation token, so a single cancel aborts an
//! entire phase's chain of calls.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vibesdk_core::error::{Cancelled, RateLimitExceeded};

#[derive(Debug, Clone, Serialize)]
pub struct InferenceMessage {
    pub role: String,
    pub content: String,
}

impl InferenceMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub messages: Vec<InferenceMessage>,
    /// When set, chunks are forwarded as they arrive; the final string is
    /// still returned whole.
    pub on_chunk: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, request: InferenceRequest, abort: &CancellationToken) -> Result<String>;
}

/// Per-agent inference context threaded into every operation. Nested calls
/// reuse the same abort handle.
#[derive(Clone)]
pub struct InferenceContext {
    pub client: Arc<dyn InferenceClient>,
    pub model: String,
    pub user_id: String,
    pub abort: CancellationToken,
}

impl InferenceContext {
    pub async fn infer(&self, messages: Vec<InferenceMessage>) -> Result<String> {
        self.client
            .infer(
                InferenceRequest {
                    model: self.model.clone(),
                    messages,
                    on_chunk: None,
                },
                &self.abort,
            )
            .await
    }

    pub async fn infer_streaming(
        &self,
        messages: Vec<InferenceMessage>,
        on_chunk: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        self.client
            .infer(
                InferenceRequest {
                    model: self.model.clone(),
                    messages,
                    on_chunk: Some(on_chunk),
                },
                &self.abort,
            )
            .await
    }
}

// ── HTTP backend ─────────────────────────────────────────────────────────

/// Calls an OpenAI-compatible chat-completions endpoint.
pub struct HttpInferenceClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [InferenceMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn infer_final(
        &self,
        request: &InferenceRequest,
        abort: &CancellationToken,
    ) -> Result<String> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: false,
        };
        let send = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = abort.cancelled() => return Err(anyhow!(Cancelled)),
            response = send => response.context("inference request failed")?,
        };
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(anyhow!(RateLimitExceeded { scope: "inference".into() }));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("inference returned {status}: {}", truncate(&body, 300)));
        }
        let parsed: ChatResponse = response.json().await.context("parse inference response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("inference response had no choices"))
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
        on_chunk: &mpsc::UnboundedSender<String>,
        abort: &CancellationToken,
    ) -> Result<String> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
        };
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("inference request failed")?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(anyhow!(RateLimitExceeded { scope: "inference".into() }));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("inference returned {status}: {}", truncate(&body, 300)));
        }

        let mut full = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = abort.cancelled() => return Err(anyhow!(Cancelled)),
                next = stream.next() => next,
            };
            let Some(bytes) = next else { break };
            let bytes = bytes.context("inference stream error")?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // SSE frames are newline-delimited `data: {...}` lines.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                let Some(payload) = line.strip_prefix("data: ") else { continue };
                if payload == "[DONE]" {
                    continue;
                }
                let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) else {
                    continue;
                };
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        full.push_str(&content);
                        let _ = on_chunk.send(content);
                    }
                }
            }
        }
        Ok(full)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, request: InferenceRequest, abort: &CancellationToken) -> Result<String> {
        if abort.is_cancelled() {
            return Err(anyhow!(Cancelled));
        }
        info!(
            model = %request.model,
            messages = request.messages.len(),
            streaming = request.on_chunk.is_some(),
            "inference call"
        );
        let result = match request.on_chunk.clone() {
            Some(tx) => self.infer_stream(&request, &tx, abort).await,
            None => self.infer_final(&request, abort).await,
        };
        if let Err(ref e) = result {
            if !vibesdk_core::error::is_cancelled(e) {
                warn!("inference call failed: {e:#}");
            }
        }
        result
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
