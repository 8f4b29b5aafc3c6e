//! Phase generation and phase implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;

use vibesdk_core::types::{GeneratedPhase, PhaseConcept};

use super::{
    extract_json, files_block, issues_block, user_context_block, GeneratedFile, OperationContext,
};
use crate::inference::InferenceMessage;

const PHASE_GEN_SYSTEM: &str = "You plan the next bounded implementation phase for a \
generated web project. Given the blueprint, completed phases, current files and current \
issues, return JSON {name, description, lastPhase, files: [{path, purpose, changes}], \
installCommands, deleteCommands}. Return files: [] when the project is complete. \
Return only JSON.";

const PHASE_IMPL_SYSTEM: &str = "You implement one phase of a generated web project. \
Return JSON {files: [{path, purpose, contents}], commands: []} with the complete new \
contents of every file the phase touches. Return only JSON.";

/// Result of implementing a phase: full file contents plus any commands the
/// model wants executed (run without retries).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhaseImplementation {
    pub files: Vec<GeneratedFile>,
    pub commands: Vec<String>,
}

/// Ask for the next phase. An empty `files` list signals FINALIZING.
pub async fn generate_next_phase(
    ctx: &OperationContext,
    phases: &[GeneratedPhase],
) -> Result<PhaseConcept> {
    let blueprint = serde_json::to_string(&ctx.blueprint).unwrap_or_default();
    let done: Vec<&str> = phases
        .iter()
        .filter(|p| p.completed)
        .map(|p| p.concept.name.as_str())
        .collect();
    let prompt = format!(
        "Blueprint: {blueprint}\n\nCompleted phases: {}\n\nCurrent issues:\n{}\n\n{}\nCurrent files:\n{}",
        done.join(", "),
        issues_block(&ctx.runtime_errors, &ctx.static_analysis),
        user_context_block(&ctx.user_inputs, &ctx.user_images),
        files_block(&ctx.relevant_files),
    );
    let raw = ctx
        .inference
        .infer(vec![InferenceMessage::system(PHASE_GEN_SYSTEM), InferenceMessage::user(prompt)])
        .await?;
    extract_json::<PhaseConcept>(&raw).context("next-phase output did not parse")
}

/// Implement a phase, forwarding raw model chunks to `on_chunk` for live
/// display.
pub async fn implement_phase(
    ctx: &OperationContext,
    phase: &PhaseConcept,
    on_chunk: mpsc::UnboundedSender<String>,
) -> Result<PhaseImplementation> {
    let phase_json = serde_json::to_string(phase).unwrap_or_default();
    let prompt = format!(
        "Phase to implement: {phase_json}\n\nCurrent issues:\n{}\n\n{}\nCurrent files:\n{}",
        issues_block(&ctx.runtime_errors, &ctx.static_analysis),
        user_context_block(&ctx.user_inputs, &ctx.user_images),
        files_block(&ctx.relevant_files),
    );
    let raw = ctx
        .inference
        .infer_streaming(
            vec![InferenceMessage::system(PHASE_IMPL_SYSTEM), InferenceMessage::user(prompt)],
            on_chunk,
        )
        .await?;
    extract_json::<PhaseImplementation>(&raw).context("phase implementation did not parse")
}
