//! Simple code generation: a single-shot instruction → changed files call,
//! used by deep-debug sessions for targeted fixes.

use anyhow::{Context, Result};
use serde::Deserialize;

use super::{extract_json, files_block, issues_block, GeneratedFile, OperationContext};
use crate::inference::InferenceMessage;

const SYSTEM: &str = "You apply one targeted change to a generated web project. Return \
JSON {explanation, files: [{path, purpose, contents}]} containing only the files you \
changed, each with complete new contents. Return only JSON.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleCodeGenOutput {
    pub explanation: String,
    pub files: Vec<GeneratedFile>,
}

pub async fn simple_code_gen(
    ctx: &OperationContext,
    instruction: &str,
) -> Result<SimpleCodeGenOutput> {
    let prompt = format!(
        "Instruction: {instruction}\n\nCurrent issues:\n{}\n\nProject files:\n{}",
        issues_block(&ctx.runtime_errors, &ctx.static_analysis),
        files_block(&ctx.relevant_files),
    );
    let raw = ctx
        .inference
        .infer(vec![InferenceMessage::system(SYSTEM), InferenceMessage::user(prompt)])
        .await?;
    extract_json::<SimpleCodeGenOutput>(&raw).context("simple code gen did not parse")
}
