use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Behavior / dev state ─────────────────────────────────────────────────

/// Which build loop the agent runs. The agentic loop is declared but its
/// planner is stubbed; the phasic loop is the production path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorKind {
    Phasic,
    Agentic,
}

impl Default for BehaviorKind {
    fn default() -> Self {
        Self::Phasic
    }
}

/// Current position of the agent's build state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevState {
    Idle,
    PhaseGenerating,
    PhaseImplementing,
    Reviewing,
    Finalizing,
}

impl Default for DevState {
    fn default() -> Self {
        Self::Idle
    }
}

// ── Blueprint ────────────────────────────────────────────────────────────

/// One step of the planned build roadmap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapPhase {
    pub name: String,
    pub description: String,
}

/// Structured project plan produced by the blueprint operation from the
/// user's query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Blueprint {
    pub title: String,
    pub description: String,
    pub detailed_description: String,
    pub project_name: String,
    pub color_palette: Vec<String>,
    pub views: Vec<String>,
    pub user_flow: String,
    pub data_flow: String,
    pub architecture: String,
    pub pitfalls: Vec<String>,
    pub frameworks: Vec<String>,
    pub implementation_roadmap: Vec<RoadmapPhase>,
    pub initial_phase: PhaseConcept,
}

// ── Phases and files ─────────────────────────────────────────────────────

/// A file targeted by a phase, before its contents exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConcept {
    pub path: String,
    pub purpose: String,
    pub changes: Option<String>,
}

/// A bounded step of generation: name, description and target files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhaseConcept {
    pub name: String,
    pub description: String,
    pub last_phase: bool,
    pub files: Vec<FileConcept>,
    pub install_commands: Vec<String>,
    pub delete_commands: Vec<String>,
}

/// A phase the agent has generated, with its completion flag. The phases
/// list is append-only; `completed` flips false→true at most once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratedPhase {
    #[serde(flatten)]
    pub concept: PhaseConcept,
    pub completed: bool,
}

/// A logical file as tracked by the file manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileState {
    pub file_path: String,
    pub file_contents: String,
    pub file_purpose: String,
    /// Unified diff between the previous contents and the current ones
    /// (full-add diff for a new file).
    pub last_diff: String,
}

// ── Conversation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message in a session's history. `conversation_id` is stable across
/// streaming updates: re-adding the same id replaces the message in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

impl ConversationMessage {
    pub fn new(conversation_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            tool_calls: None,
        }
    }
}

// ── Workspace ────────────────────────────────────────────────────────────

/// A commit as reported by `log`/`show`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub oid: String,
    pub message: String,
    /// "Name <email>" form.
    pub author: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

// ── Sandbox / deployment ─────────────────────────────────────────────────

/// Metadata persisted as `metadata.json` inside each sandbox instance dir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxInstanceMetadata {
    pub template_name: String,
    pub project_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub preview_url: Option<String>,
    pub allocated_port: Option<u16>,
    pub process_id: Option<String>,
    pub dont_touch_files: Vec<String>,
    pub redacted_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// A runtime error harvested from a sandbox instance's dev process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub raw_output: String,
}

/// One diagnostic from lint or typecheck.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisIssue {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub code: String,
    pub message: String,
    pub severity: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisReport {
    pub issues: Vec<AnalysisIssue>,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticAnalysisResult {
    pub lint: AnalysisReport,
    pub typecheck: AnalysisReport,
}

// ── Templates ────────────────────────────────────────────────────────────

/// Commands a starter template declares for its lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateCommands {
    pub bootstrap: String,
    pub dev: String,
    pub lint: String,
    pub typecheck: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateFile {
    pub path: String,
    pub contents: String,
}

/// A starter template resolved from the template library on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateDetails {
    pub name: String,
    pub description: String,
    pub frameworks: Vec<String>,
    pub commands: TemplateCommands,
    pub dont_touch_files: Vec<String>,
    pub redacted_files: Vec<String>,
    pub files: Vec<TemplateFile>,
}

impl TemplateDetails {
    pub fn file(&self, path: &str) -> Option<&TemplateFile> {
        self.files.iter().find(|f| f.path == path)
    }
}
