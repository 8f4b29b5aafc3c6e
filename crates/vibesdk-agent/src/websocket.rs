//! Typed websocket fan-out. Each agent owns a hub of active connections;
//! `broadcast` serializes once and sends to every open socket, and project
//! update kinds are also appended to the agent's project-update
//! accumulator.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsMessageType {
    #[serde(rename = "agent_connected")]
    AgentConnected,
    GenerationStarted,
    GenerationComplete,
    PhaseGenerating,
    PhaseGenerated,
    PhaseImplementing,
    PhaseValidating,
    PhaseValidated,
    PhaseImplemented,
    FileGenerating,
    FileChunkGenerated,
    FileGenerated,
    FileRegenerating,
    FileRegenerated,
    StaticAnalysisResults,
    RuntimeErrorFound,
    DeterministicCodeFixStarted,
    DeterministicCodeFixCompleted,
    DeploymentStarted,
    DeploymentCompleted,
    DeploymentFailed,
    CommandExecuting,
    ConversationResponse,
    ConversationCleared,
    GithubExportStarted,
    GithubExportProgress,
    GithubExportCompleted,
    GithubExportError,
    ScreenshotCaptureStarted,
    ScreenshotCaptureSuccess,
    ScreenshotCaptureError,
    RateLimitError,
    Error,
}

impl WsMessageType {
    /// Kinds whose payload text is also folded into the project-update
    /// accumulator shown to returning clients.
    pub fn is_project_update(self) -> bool {
        matches!(
            self,
            Self::PhaseGenerated
                | Self::PhaseImplemented
                | Self::DeploymentCompleted
                | Self::ConversationResponse
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub message_type: WsMessageType,
    pub data: Value,
}

pub struct WebSocketHub {
    connections: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    project_updates: Mutex<Vec<String>>,
}

impl Default for WebSocketHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketHub {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            project_updates: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, conn_id: &str, sender: mpsc::UnboundedSender<String>) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.insert(conn_id.to_string(), sender);
        debug!(conn_id, total = connections.len(), "websocket registered");
    }

    /// Invoked on close; also reached lazily when a send fails.
    pub fn remove(&self, conn_id: &str) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.remove(conn_id);
        debug!(conn_id, total = connections.len(), "websocket removed");
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Serialize once and send to every open connection. Dead connections
    /// are dropped from the set.
    pub fn broadcast(&self, message_type: WsMessageType, data: Value) {
        if message_type.is_project_update() {
            let text = data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| data.to_string());
            self.project_updates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(text);
        }

        let Ok(payload) = serde_json::to_string(&WsEnvelope { message_type, data }) else {
            return;
        };
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.retain(|_, sender| sender.send(payload.clone()).is_ok());
    }

    /// Directed send to a single connection.
    pub fn send_to(&self, conn_id: &str, message_type: WsMessageType, data: Value) {
        let Ok(payload) = serde_json::to_string(&WsEnvelope { message_type, data }) else {
            return;
        };
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = connections.get(conn_id) {
            if sender.send(payload).is_err() {
                connections.remove(conn_id);
            }
        }
    }

    /// Drain the accumulated project-update texts (consumed into durable
    /// agent state).
    pub fn drain_project_updates(&self) -> Vec<String> {
        let mut updates = self.project_updates.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_types_serialize_as_wire_names() {
        let json = serde_json::to_string(&WsMessageType::PhaseGenerated).expect("serialize");
        assert_eq!(json, "\"PHASE_GENERATED\"");
        let json = serde_json::to_string(&WsMessageType::AgentConnected).expect("serialize");
        assert_eq!(json, "\"agent_connected\"");
        let json = serde_json::to_string(&WsMessageType::RateLimitError).expect("serialize");
        assert_eq!(json, "\"RATE_LIMIT_ERROR\"");
    }

    #[test]
    fn broadcast_reaches_all_live_connections() {
        let hub = WebSocketHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.register("c1", tx1);
        hub.register("c2", tx2);

        hub.broadcast(WsMessageType::GenerationStarted, json!({"ok": true}));
        assert!(rx1.try_recv().expect("c1 message").contains("GENERATION_STARTED"));
        assert!(rx2.try_recv().expect("c2 message").contains("GENERATION_STARTED"));
    }

    #[test]
    fn dead_connections_are_pruned_on_broadcast() {
        let hub = WebSocketHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register("gone", tx);
        drop(rx);

        hub.broadcast(WsMessageType::Error, json!({}));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn project_updates_accumulate_message_text() {
        let hub = WebSocketHub::new();
        hub.broadcast(
            WsMessageType::PhaseImplemented,
            json!({"message": "Phase 'Core UI' implemented"}),
        );
        hub.broadcast(WsMessageType::FileGenerated, json!({"message": "not accumulated"}));

        let updates = hub.drain_project_updates();
        assert_eq!(updates, vec!["Phase 'Core UI' implemented".to_string()]);
        assert!(hub.drain_project_updates().is_empty());
    }
}
