//! WebSocket upgrade: attach the connection to the agent's hub, send the
//! `agent_connected` snapshot, then pump broadcasts out and client
//! commands in until the socket closes.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vibesdk_agent::agent::CodeGenAgent;
use vibesdk_agent::operations::UserImage;
use vibesdk_agent::websocket::WsMessageType;
use vibesdk_core::ids::short_id;

use crate::AppState;

pub(crate) async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match state.agents.get_or_create(&agent_id).await {
            Ok(agent) => serve_socket(socket, agent).await,
            Err(e) => warn!(agent_id, "websocket attach failed: {e:#}"),
        }
    })
}

async fn serve_socket(socket: WebSocket, agent: Arc<CodeGenAgent>) {
    let conn_id = format!("ws-{}", short_id(10));
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    agent.hub().register(&conn_id, tx);

    // Handshake: full state + template details for the fresh client.
    let snapshot = agent.get_full_state().await;
    agent
        .hub()
        .send_to(&conn_id, WsMessageType::AgentConnected, snapshot);

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_client_message(&agent, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    agent.hub().remove(&conn_id);
    writer.abort();
    debug!(conn_id, "websocket closed");
}

async fn handle_client_message(agent: &Arc<CodeGenAgent>, text: &str) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "user_request" => {
            let text = message.get("text").and_then(Value::as_str).unwrap_or_default();
            let images: Vec<UserImage> = message
                .get("images")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if !text.is_empty() {
                agent.queue_user_request(text, images).await;
                agent.generate_all_files().await;
            }
        }
        "generate" => agent.generate_all_files().await,
        "cancel" => agent.cancel_current_inference(),
        "conversation" => {
            let text = message.get("message").and_then(Value::as_str).unwrap_or_default();
            if !text.is_empty() {
                if let Err(e) = agent.process_conversation_message(text).await {
                    agent.hub().broadcast(
                        WsMessageType::Error,
                        json!({ "message": format!("{e:#}") }),
                    );
                }
            }
        }
        other => debug!(kind = other, "ignoring unknown websocket message"),
    }
}
