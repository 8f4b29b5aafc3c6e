//! Blueprint generation: user query → structured project plan, streamed.

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use vibesdk_core::types::Blueprint;

use super::{extract_json, OperationContext};
use crate::inference::InferenceMessage;

const SYSTEM: &str = "You are a senior product engineer. Produce a JSON project blueprint \
for the user's request with fields: title, description, detailedDescription, projectName, \
colorPalette, views, userFlow, dataFlow, architecture, pitfalls, frameworks, \
implementationRoadmap (list of {name, description}), and initialPhase \
({name, description, lastPhase, files: [{path, purpose}], installCommands}). \
Return only JSON.";

pub async fn generate_blueprint(
    ctx: &OperationContext,
    on_chunk: mpsc::UnboundedSender<String>,
) -> Result<Blueprint> {
    let template_summary = ctx
        .template
        .as_ref()
        .map(|t| format!("Starter template: {} (frameworks: {})", t.name, t.frameworks.join(", ")))
        .unwrap_or_default();
    let messages = vec![
        InferenceMessage::system(SYSTEM),
        InferenceMessage::user(format!("{template_summary}\n\nRequest: {}", ctx.query)),
    ];
    let raw = ctx.inference.infer_streaming(messages, on_chunk).await?;
    extract_json::<Blueprint>(&raw).context("blueprint output did not parse")
}
