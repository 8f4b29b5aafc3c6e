//! Project setup operations: predicted setup commands, AI-assisted install
//! recovery, and README generation.

use anyhow::{Context, Result};

use super::{extract_json, strip_fence, OperationContext};
use crate::inference::InferenceMessage;

const SETUP_SYSTEM: &str = "You predict the shell commands a freshly generated web project \
needs before first run (installs, codegen). Return a JSON array of command strings. \
Return only JSON.";

const ASSISTANT_SYSTEM: &str = "You are a project setup assistant. An install command \
failed; suggest replacement commands that achieve the same goal (correct package name, \
alternative package). Return a JSON array of command strings. Return only JSON.";

const README_SYSTEM: &str = "Write a README.md for the described project: short intro, \
features, tech stack, local development instructions. Include the literal placeholder \
[cloudflarebutton] near the top. Return only markdown.";

pub async fn predict_setup_commands(ctx: &OperationContext) -> Result<Vec<String>> {
    let blueprint = serde_json::to_string(&ctx.blueprint).unwrap_or_default();
    let raw = ctx
        .inference
        .infer(vec![
            InferenceMessage::system(SETUP_SYSTEM),
            InferenceMessage::user(format!("Blueprint: {blueprint}")),
        ])
        .await?;
    extract_json::<Vec<String>>(&raw).context("setup commands did not parse")
}

/// The "projectSetupAssistant": alternatives for a failed install command.
pub async fn suggest_alternative_commands(
    ctx: &OperationContext,
    failed_command: &str,
    error_output: &str,
) -> Result<Vec<String>> {
    let raw = ctx
        .inference
        .infer(vec![
            InferenceMessage::system(ASSISTANT_SYSTEM),
            InferenceMessage::user(format!(
                "Failed command: {failed_command}\n\nError output:\n{error_output}"
            )),
        ])
        .await?;
    extract_json::<Vec<String>>(&raw).context("alternative commands did not parse")
}

pub async fn generate_readme(ctx: &OperationContext) -> Result<String> {
    let blueprint = serde_json::to_string(&ctx.blueprint).unwrap_or_default();
    let raw = ctx
        .inference
        .infer(vec![
            InferenceMessage::system(README_SYSTEM),
            InferenceMessage::user(format!("Blueprint: {blueprint}")),
        ])
        .await?;
    Ok(strip_fence(&raw))
}
