//! User conversation processing: free-form chat about the project while a
//! build may be running.

use anyhow::Result;

use vibesdk_core::types::{ConversationMessage, MessageRole};

use super::OperationContext;
use crate::inference::InferenceMessage;

const SYSTEM: &str = "You are the assistant for an AI app builder. Answer questions about \
the generated project concisely. If the user is asking for a change to the app, \
acknowledge it; the build loop will pick the request up as a phase input.";

pub async fn process_user_message(
    ctx: &OperationContext,
    history: &[ConversationMessage],
    message: &str,
) -> Result<String> {
    let mut messages = vec![InferenceMessage::system(SYSTEM)];
    if let Some(ref blueprint) = ctx.blueprint {
        messages.push(InferenceMessage::system(format!(
            "Project: {} — {}",
            blueprint.title, blueprint.description
        )));
    }
    for entry in history {
        let msg = match entry.role {
            MessageRole::User => InferenceMessage::user(entry.content.clone()),
            MessageRole::Assistant => InferenceMessage::assistant(entry.content.clone()),
            MessageRole::System => InferenceMessage::system(entry.content.clone()),
        };
        messages.push(msg);
    }
    messages.push(InferenceMessage::user(message));
    ctx.inference.infer(messages).await
}
