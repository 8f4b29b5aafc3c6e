//! Operations: named, pure calls from context to result. Each wraps one
//! LLM role (blueprint, phase generation, phase implementation, file
//! regeneration, fixers, conversation processing) and parses the model's
//! JSON output into typed results.

pub mod blueprint;
pub mod conversation;
pub mod phases;
pub mod regen;
pub mod setup;
pub mod simple;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use vibesdk_core::types::{
    Blueprint, FileState, RuntimeError, StaticAnalysisResult, TemplateDetails,
};

use crate::inference::InferenceContext;

/// A user-supplied image accompanying an in-flight phase. Kept in memory
/// only; lost on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserImage {
    pub filename: String,
    pub mime_type: String,
    pub base64_data: String,
}

/// Everything an operation may read. Built fresh by the agent before each
/// call; the inference handle carries the shared abort token.
#[derive(Clone)]
pub struct OperationContext {
    pub query: String,
    pub blueprint: Option<Blueprint>,
    pub template: Option<TemplateDetails>,
    pub relevant_files: Vec<FileState>,
    pub runtime_errors: Vec<RuntimeError>,
    pub static_analysis: StaticAnalysisResult,
    pub user_inputs: Vec<String>,
    pub user_images: Vec<UserImage>,
    pub inference: InferenceContext,
}

/// One file produced by a generation operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub path: String,
    #[serde(default)]
    pub purpose: String,
    pub contents: String,
}

// ── Output parsing ───────────────────────────────────────────────────────

/// Parse the model's JSON output: prefer a fenced ```json block, fall back
/// to the outermost braces/brackets.
pub fn extract_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    if let Some(fenced) = extract_fenced(raw) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Ok(value);
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (raw.find(open), raw.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&raw[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }
    Err(anyhow!(
        "model output is not parseable JSON: {}",
        raw.chars().take(200).collect::<String>()
    ))
}

fn extract_fenced(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let after = &raw[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Strip a surrounding code fence from free-form text output (README,
/// single-file contents).
pub fn strip_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(body_start) = rest.find('\n') {
            let body = &rest[body_start + 1..];
            if let Some(end) = body.rfind("```") {
                return body[..end].trim_end().to_string();
            }
        }
    }
    trimmed.to_string()
}

// ── Shared prompt fragments ──────────────────────────────────────────────

pub(crate) fn files_block(files: &[FileState]) -> String {
    let mut block = String::new();
    for file in files {
        block.push_str(&format!(
            "--- {} ({})\n{}\n",
            file.file_path, file.file_purpose, file.file_contents
        ));
    }
    block
}

pub(crate) fn issues_block(
    runtime_errors: &[RuntimeError],
    analysis: &StaticAnalysisResult,
) -> String {
    let mut block = String::new();
    for err in runtime_errors {
        block.push_str(&format!("runtime: {}\n", err.message));
    }
    for issue in analysis.lint.issues.iter().chain(&analysis.typecheck.issues) {
        block.push_str(&format!(
            "{}({},{}): {} {}\n",
            issue.file, issue.line, issue.column, issue.code, issue.message
        ));
    }
    if block.is_empty() {
        block.push_str("none\n");
    }
    block
}

pub(crate) fn user_context_block(inputs: &[String], images: &[UserImage]) -> String {
    let mut block = String::new();
    for input in inputs {
        block.push_str(&format!("user request: {input}\n"));
    }
    for image in images {
        block.push_str(&format!("user attached image: {} ({})\n", image.filename, image.mime_type));
    }
    block
}
