//! The per-project code generation agent: durable state, the phasic build
//! state machine, cancellation, self-repair, and the websocket surface.
//!
//! One build task and at most one deep-debug task run per agent; both hang
//! off the same cancellation token, so a single cancel aborts an entire
//! phase's chain of inference calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vibesdk_core::{
    config::Config,
    conversation::ConversationLog,
    db::{AppService, Db},
    deploy::{DeployEvent, DeployHook, DeploymentManager},
    error::{is_cancelled, is_rate_limited},
    files::FileManager,
    ids::short_id,
    sandbox::{ExecOptions, Sandbox},
    templates,
    types::{
        BehaviorKind, Blueprint, DevState, FileState, GeneratedPhase, MessageRole, PhaseConcept,
        ConversationMessage,
    },
    workspace::Workspace,
};

use crate::behavior::Behavior;
use crate::commands::{
    is_install_command, merge_history, paths_in_delete_command, COMMAND_CHUNK_SIZE,
    INSTALL_COMMAND_RETRIES,
};
use crate::inference::{InferenceClient, InferenceContext};
use crate::operations::{self, OperationContext, UserImage};
use crate::websocket::{WebSocketHub, WsMessageType};

/// A queued user request recharges the phases budget to at least this many
/// remaining rounds.
const USER_INPUT_PHASE_RECHARGE: i32 = 3;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const PROJECT_NAME_MAX_STEM: usize = 20;

// ── Durable state ────────────────────────────────────────────────────────

/// Everything the agent persists. Pending images, the GitHub token cache
/// and the abort handle are deliberately absent: they are wiped on restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentState {
    pub behavior: BehaviorKind,
    pub agent_id: String,
    pub session_id: String,
    pub host_name: String,
    pub user_id: String,
    pub query: String,
    pub blueprint: Option<Blueprint>,
    pub template_name: String,
    pub project_name: String,
    pub generated_phases: Vec<GeneratedPhase>,
    pub generated_files: HashMap<String, FileState>,
    pub commands_history: Vec<String>,
    pub last_package_json: String,
    pub pending_user_inputs: Vec<String>,
    pub project_updates: Vec<String>,
    pub dev_state: DevState,
    pub phases_counter: i32,
    pub mvp_generated: bool,
    pub reviewing_initiated: bool,
    pub should_be_generating: bool,
    pub last_deep_debug_transcript: Option<String>,
    pub current_plan: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitArgs {
    pub query: String,
    pub user_id: String,
    pub host_name: String,
    pub template_name: Option<String>,
    pub behavior: BehaviorKind,
}

pub struct CodeGenAgent {
    agent_id: String,
    config: Arc<Config>,
    state: Mutex<AgentState>,
    db: Arc<Db>,
    app_service: AppService,
    file_manager: Arc<FileManager>,
    deployment: StdMutex<Option<Arc<DeploymentManager>>>,
    conversations: ConversationLog,
    hub: Arc<WebSocketHub>,
    inference_client: Arc<dyn InferenceClient>,
    pending_images: StdMutex<Vec<UserImage>>,
    abort: StdMutex<Option<CancellationToken>>,
    build_running: AtomicBool,
    deep_debug_running: AtomicBool,
    github_token: StdMutex<Option<String>>,
}

impl CodeGenAgent {
    /// Open (or reopen) an agent over its local database. Durable state is
    /// restored when present; ephemeral fields start empty.
    pub fn open(
        agent_id: &str,
        config: Arc<Config>,
        db: Arc<Db>,
        app_service: AppService,
        inference_client: Arc<dyn InferenceClient>,
    ) -> Result<Arc<Self>> {
        db.migrate_agent()?;

        let state: AgentState = db
            .load_agent_state(agent_id)?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_else(|| AgentState {
                agent_id: agent_id.to_string(),
                session_id: short_id(12),
                phases_counter: config.max_phases as i32,
                ..Default::default()
            });

        let mut workspace = Workspace::new(Arc::clone(&db));
        workspace.init("main")?;
        let file_manager = Arc::new(FileManager::new(Arc::new(workspace)));

        let deployment = if state.template_name.is_empty() {
            None
        } else {
            let template = templates::load_template(&config.data_dir, &state.template_name)?;
            Some(Arc::new(DeploymentManager::new(
                &config.data_dir,
                &config.host,
                template,
                &state.project_name,
                Duration::from_secs(config.sandbox_bootstrap_timeout_s),
            )))
        };

        let restored_files = state.generated_files.clone();
        let agent = Arc::new(Self {
            agent_id: agent_id.to_string(),
            config,
            state: Mutex::new(state),
            conversations: ConversationLog::new(Arc::clone(&db)),
            db,
            app_service,
            file_manager,
            deployment: StdMutex::new(deployment),
            hub: Arc::new(WebSocketHub::new()),
            inference_client,
            pending_images: StdMutex::new(Vec::new()),
            abort: StdMutex::new(None),
            build_running: AtomicBool::new(false),
            deep_debug_running: AtomicBool::new(false),
            github_token: StdMutex::new(None),
        });

        if !restored_files.is_empty() {
            let fm = Arc::clone(&agent.file_manager);
            tokio::spawn(async move { fm.restore(restored_files).await });
        }
        Ok(agent)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn hub(&self) -> &Arc<WebSocketHub> {
        &self.hub
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    pub fn deployment(&self) -> Option<Arc<DeploymentManager>> {
        self.deployment
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn conversations(&self) -> &ConversationLog {
        &self.conversations
    }

    fn broadcast(&self, message_type: WsMessageType, data: Value) {
        self.hub.broadcast(message_type, data);
    }

    // ── Abort handle ─────────────────────────────────────────────────────

    /// Acquire (or reuse) the agent-wide abort handle. Nested inference
    /// calls share it, so one cancel aborts the whole phase.
    fn acquire_abort(&self) -> CancellationToken {
        let mut guard = self.abort.lock().unwrap_or_else(|e| e.into_inner());
        guard.get_or_insert_with(CancellationToken::new).clone()
    }

    fn clear_abort(&self) {
        let mut guard = self.abort.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn cancel_current_inference(&self) {
        let guard = self.abort.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.as_ref() {
            info!(agent_id = %self.agent_id, "cancelling current inference");
            token.cancel();
        }
    }

    // ── Initialization ───────────────────────────────────────────────────

    /// Resolve a template, generate the blueprint (streaming), customize
    /// and commit the template files, persist the app record, then kick off
    /// the async part (deploy + setup commands + README) in the background.
    pub async fn initialize(self: &Arc<Self>, args: InitArgs) -> Result<Blueprint> {
        let template =
            templates::resolve_template(&self.config.data_dir, args.template_name.as_deref())?;
        info!(agent_id = %self.agent_id, template = %template.name, "initializing agent");

        {
            let mut state = self.state.lock().await;
            state.agent_id = self.agent_id.clone();
            state.query = args.query.clone();
            state.user_id = args.user_id.clone();
            state.host_name = args.host_name.clone();
            state.behavior = args.behavior;
            state.template_name = template.name.clone();
            state.phases_counter = self.config.max_phases as i32;
        }

        // Blueprint, streamed chunk-by-chunk to connected clients.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let hub = Arc::clone(&self.hub);
        let chunk_pump = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                hub.broadcast(WsMessageType::FileChunkGenerated, json!({ "chunk": chunk }));
            }
        });
        // The deployment manager does not exist yet, so hand the resolved
        // template to the operation directly.
        let mut ctx = self.operation_context(false, false).await;
        ctx.template = Some(template.clone());
        let blueprint = operations::blueprint::generate_blueprint(&ctx, chunk_tx).await?;
        chunk_pump.abort();

        let project_name = derive_project_name(&blueprint.project_name, &blueprint.title);

        // Template files land as the initial commit; the project-specific
        // customizations follow as a second one.
        let initial: Vec<(String, String, String)> = template
            .files
            .iter()
            .map(|f| (f.path.clone(), f.contents.clone(), String::new()))
            .collect();
        self.file_manager.save_many(&initial, "Initial commit").await?;

        let customized = customize_template_files(&template, &project_name);
        if !customized.is_empty() {
            self.file_manager
                .save_many(&customized, "chore: Initialize project configuration files")
                .await?;
        }

        {
            let mut state = self.state.lock().await;
            state.blueprint = Some(blueprint.clone());
            state.project_name = project_name.clone();
        }

        let deployment = Arc::new(DeploymentManager::new(
            &self.config.data_dir,
            &self.config.host,
            template,
            &project_name,
            Duration::from_secs(self.config.sandbox_bootstrap_timeout_s),
        ));
        {
            let mut guard = self.deployment.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(deployment);
        }

        if let Err(e) = self.app_service.create_app(
            &self.agent_id,
            &args.user_id,
            &blueprint.title,
            &blueprint.description,
            &project_name,
            &self.state.lock().await.template_name,
        ) {
            warn!(agent_id = %self.agent_id, "create_app failed: {e:#}");
        }

        self.persist_state().await;

        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.initialize_async().await });

        Ok(blueprint)
    }

    /// Post-initialize work, run in parallel: first deploy, predicted setup
    /// commands, README. The predicted commands execute once the deploy is
    /// up.
    async fn initialize_async(self: Arc<Self>) {
        let ctx = self.operation_context(false, false).await;

        let deploy = async {
            let all = self.file_manager.get_all_files().await;
            let files: Vec<(String, String)> = all
                .into_iter()
                .map(|f| (f.file_path, f.file_contents))
                .collect();
            match self.deployment() {
                Some(deployment) => {
                    deployment
                        .deploy_to_sandbox(&files, false, "initial deploy", false, &self.deploy_hook())
                        .await
                }
                None => Ok(None),
            }
        };
        let setup = operations::setup::predict_setup_commands(&ctx);
        let readme = operations::setup::generate_readme(&ctx);

        let (deploy_result, setup_result, readme_result) = tokio::join!(deploy, setup, readme);

        match deploy_result {
            Ok(url) => info!(agent_id = %self.agent_id, preview = ?url, "initial deploy finished"),
            Err(e) => warn!(agent_id = %self.agent_id, "initial deploy failed: {e:#}"),
        }

        if let Ok(readme) = readme_result {
            if let Err(e) = self
                .file_manager
                .save_file("README.md", &readme, "project readme", "docs: add README")
                .await
            {
                warn!(agent_id = %self.agent_id, "failed to save README: {e:#}");
            }
        }

        match setup_result {
            Ok(commands) if !commands.is_empty() => {
                self.deploy_hook()(DeployEvent::AfterSetupCommands {
                    commands: commands.clone(),
                });
                if let Err(e) = self.execute_commands(&commands, true).await {
                    warn!(agent_id = %self.agent_id, "setup commands failed: {e:#}");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(agent_id = %self.agent_id, "setup command prediction failed: {e:#}"),
        }
        self.persist_state().await;
    }

    fn deploy_hook(&self) -> DeployHook {
        let hub = Arc::clone(&self.hub);
        Arc::new(move |event| match event {
            DeployEvent::Started { instance_id, message } => hub.broadcast(
                WsMessageType::DeploymentStarted,
                json!({ "instanceId": instance_id, "message": message }),
            ),
            DeployEvent::Completed { preview_url } => hub.broadcast(
                WsMessageType::DeploymentCompleted,
                json!({ "previewUrl": preview_url, "message": format!("deployed to {preview_url}") }),
            ),
            DeployEvent::Failed { message } => {
                hub.broadcast(WsMessageType::DeploymentFailed, json!({ "message": message }))
            }
            DeployEvent::AfterSetupCommands { commands } => hub.broadcast(
                WsMessageType::CommandExecuting,
                json!({ "commands": commands }),
            ),
        })
    }

    // ── User input ───────────────────────────────────────────────────────

    /// Queue a mid-build user request. In phasic mode this also recharges
    /// the phases budget so the loop runs at least a few more rounds.
    pub async fn queue_user_request(&self, text: &str, images: Vec<UserImage>) {
        {
            let mut state = self.state.lock().await;
            state.pending_user_inputs.push(text.to_string());
            if state.behavior == BehaviorKind::Phasic {
                state.phases_counter = state.phases_counter.max(USER_INPUT_PHASE_RECHARGE);
            }
            state.should_be_generating = true;
        }
        self.pending_images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(images);

        let session_id = self.state.lock().await.session_id.clone();
        let message = ConversationMessage::new(
            format!("user-{}", short_id(8)),
            MessageRole::User,
            text,
        );
        if let Err(e) = self.conversations.add(&session_id, message) {
            warn!(agent_id = %self.agent_id, "failed to log user request: {e:#}");
        }
        self.persist_state().await;
    }

    // ── Build loop entry ─────────────────────────────────────────────────

    /// Start the build task. No-op while a build runs, and no-op once the
    /// MVP exists unless user inputs are pending.
    pub async fn generate_all_files(self: &Arc<Self>) {
        if self.build_running.load(Ordering::Acquire) {
            info!(agent_id = %self.agent_id, "build already running, ignoring");
            return;
        }
        {
            let state = self.state.lock().await;
            if state.mvp_generated && state.pending_user_inputs.is_empty() {
                info!(agent_id = %self.agent_id, "mvp generated and no pending inputs, ignoring");
                return;
            }
        }
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.build_wrapper().await });
    }

    async fn build_wrapper(self: Arc<Self>) {
        if self.build_running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broadcast(WsMessageType::GenerationStarted, json!({}));

        let behavior = Behavior::from_kind(self.state.lock().await.behavior);
        let result = behavior.build(&self).await;

        match result {
            Ok(()) => {}
            Err(e) if is_cancelled(&e) => {
                info!(agent_id = %self.agent_id, "build cancelled");
                self.state.lock().await.dev_state = DevState::Idle;
            }
            Err(e) if is_rate_limited(&e) => {
                warn!(agent_id = %self.agent_id, "build rate limited");
                self.broadcast(
                    WsMessageType::RateLimitError,
                    json!({ "message": format!("{e:#}") }),
                );
            }
            Err(e) => {
                error!(agent_id = %self.agent_id, "build failed: {e:#}");
                self.broadcast(WsMessageType::Error, json!({ "message": format!("{e:#}") }));
                self.state.lock().await.dev_state = DevState::Idle;
            }
        }

        self.clear_abort();
        self.fold_project_updates().await;
        self.persist_state().await;
        self.broadcast(WsMessageType::GenerationComplete, json!({}));
        self.build_running.store(false, Ordering::Release);
    }

    // ── The phasic state machine ─────────────────────────────────────────

    pub(crate) async fn phasic_build_loop(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.generated_phases.iter().any(|p| !p.completed) {
                state.dev_state = DevState::PhaseImplementing;
            } else if state.generated_phases.iter().any(|p| p.completed) {
                state.dev_state = DevState::PhaseGenerating;
            } else {
                let blueprint = state
                    .blueprint
                    .clone()
                    .ok_or_else(|| anyhow!("agent has no blueprint; initialize first"))?;
                state.generated_phases.push(GeneratedPhase {
                    concept: blueprint.initial_phase,
                    completed: false,
                });
                state.dev_state = DevState::PhaseImplementing;
            }
            state.should_be_generating = true;
        }

        loop {
            let dev_state = self.state.lock().await.dev_state;
            match dev_state {
                DevState::PhaseGenerating => self.run_phase_generating().await?,
                DevState::PhaseImplementing => self.run_phase_implementing().await?,
                DevState::Finalizing => self.run_finalizing().await?,
                DevState::Reviewing => self.run_reviewing().await?,
                DevState::Idle => break,
            }
            self.persist_state().await;
        }
        self.state.lock().await.should_be_generating = false;
        Ok(())
    }

    async fn run_phase_generating(self: &Arc<Self>) -> Result<()> {
        self.broadcast(WsMessageType::PhaseGenerating, json!({}));

        let ctx = self.operation_context(true, true).await;
        let phases = self.state.lock().await.generated_phases.clone();
        let phase = operations::phases::generate_next_phase(&ctx, &phases).await?;

        if phase.files.is_empty() {
            info!(agent_id = %self.agent_id, "no further files suggested, finalizing");
            self.state.lock().await.dev_state = DevState::Finalizing;
            return Ok(());
        }

        self.state.lock().await.generated_phases.push(GeneratedPhase {
            concept: phase.clone(),
            completed: false,
        });

        if !phase.install_commands.is_empty() {
            self.execute_commands(&phase.install_commands, true).await?;
        }
        if !phase.delete_commands.is_empty() {
            self.run_delete_commands(&phase.delete_commands).await;
        }

        self.broadcast(
            WsMessageType::PhaseGenerated,
            json!({
                "name": phase.name,
                "description": phase.description,
                "lastPhase": phase.last_phase,
                "files": phase.files,
                "message": format!("phase '{}' planned", phase.name),
            }),
        );
        self.state.lock().await.dev_state = DevState::PhaseImplementing;
        Ok(())
    }

    async fn run_phase_implementing(self: &Arc<Self>) -> Result<()> {
        let Some(phase) = self
            .state
            .lock()
            .await
            .generated_phases
            .iter()
            .rev()
            .find(|p| !p.completed)
            .map(|p| p.concept.clone())
        else {
            self.state.lock().await.dev_state = DevState::PhaseGenerating;
            return Ok(());
        };

        self.broadcast(
            WsMessageType::PhaseImplementing,
            json!({ "name": phase.name }),
        );

        let ctx = self.operation_context(true, false).await;
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let hub = Arc::clone(&self.hub);
        let chunk_pump = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                hub.broadcast(WsMessageType::FileChunkGenerated, json!({ "chunk": chunk }));
            }
        });
        let implementation =
            operations::phases::implement_phase(&ctx, &phase, chunk_tx).await;
        chunk_pump.abort();
        let implementation = implementation?;

        for file in &implementation.files {
            self.broadcast(WsMessageType::FileGenerating, json!({ "path": file.path }));
        }
        let to_save: Vec<(String, String, String)> = implementation
            .files
            .iter()
            .map(|f| (f.path.clone(), f.contents.clone(), f.purpose.clone()))
            .collect();
        let commit_message = format!("feat: {}\n\n{}", phase.name, phase.description);
        let (saved, _commit) = self.file_manager.save_many(&to_save, &commit_message).await?;
        for state in &saved {
            self.broadcast(
                WsMessageType::FileGenerated,
                json!({ "path": state.file_path, "diff": state.last_diff }),
            );
        }

        if !implementation.commands.is_empty() {
            // Phase-suggested commands run without retries.
            self.execute_commands(&implementation.commands, false).await?;
        }

        if let Some(deployment) = self.deployment() {
            let files: Vec<(String, String)> = saved
                .iter()
                .map(|f| (f.file_path.clone(), f.file_contents.clone()))
                .collect();
            deployment
                .deploy_to_sandbox(&files, false, &commit_message, true, &self.deploy_hook())
                .await?;
        }

        self.broadcast(WsMessageType::PhaseValidating, json!({ "name": phase.name }));
        if let Err(e) = self.deterministic_code_fixes().await {
            if is_cancelled(&e) || is_rate_limited(&e) {
                return Err(e);
            }
            warn!(agent_id = %self.agent_id, "deterministic fixes failed: {e:#}");
        }
        if self.config.fast_smart_fixes {
            if let Err(e) = self.fast_smart_fixes().await {
                if is_cancelled(&e) || is_rate_limited(&e) {
                    return Err(e);
                }
                warn!(agent_id = %self.agent_id, "fast smart fixes failed: {e:#}");
            }
        }
        self.broadcast(WsMessageType::PhaseValidated, json!({ "name": phase.name }));

        let (finalize, name) = {
            let mut state = self.state.lock().await;
            if let Some(record) = state.generated_phases.iter_mut().rev().find(|p| !p.completed) {
                record.completed = true;
            }
            state.phases_counter -= 1;
            let finalize = (phase.last_phase || state.phases_counter <= 0)
                && state.pending_user_inputs.is_empty();
            (finalize, phase.name.clone())
        };

        self.broadcast(
            WsMessageType::PhaseImplemented,
            json!({ "name": name, "message": format!("phase '{name}' implemented") }),
        );

        self.state.lock().await.dev_state = if finalize {
            DevState::Finalizing
        } else {
            DevState::PhaseGenerating
        };
        Ok(())
    }

    async fn run_finalizing(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.mvp_generated {
                state.dev_state = DevState::Reviewing;
                return Ok(());
            }
        }

        let phase = PhaseConcept {
            name: "Finalization and Review".to_string(),
            description: "Final cleanup pass over the generated application".to_string(),
            last_phase: true,
            ..Default::default()
        };
        self.broadcast(WsMessageType::PhaseImplementing, json!({ "name": phase.name }));

        let ctx = self.operation_context(true, false).await;
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let hub = Arc::clone(&self.hub);
        let chunk_pump = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                hub.broadcast(WsMessageType::FileChunkGenerated, json!({ "chunk": chunk }));
            }
        });
        let implementation = operations::phases::implement_phase(&ctx, &phase, chunk_tx).await;
        chunk_pump.abort();

        match implementation {
            Ok(implementation) if !implementation.files.is_empty() => {
                let to_save: Vec<(String, String, String)> = implementation
                    .files
                    .iter()
                    .map(|f| (f.path.clone(), f.contents.clone(), f.purpose.clone()))
                    .collect();
                self.file_manager
                    .save_many(&to_save, "feat: Finalization and Review")
                    .await?;
            }
            Ok(_) => {}
            Err(e) if is_cancelled(&e) || is_rate_limited(&e) => return Err(e),
            Err(e) => warn!(agent_id = %self.agent_id, "finalization pass failed: {e:#}"),
        }

        {
            let mut state = self.state.lock().await;
            state.mvp_generated = true;
            state.dev_state = DevState::Reviewing;
        }
        self.broadcast(
            WsMessageType::PhaseImplemented,
            json!({ "name": phase.name, "message": "finalization complete" }),
        );
        Ok(())
    }

    async fn run_reviewing(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.reviewing_initiated {
                state.dev_state = DevState::Idle;
                return Ok(());
            }
            state.reviewing_initiated = true;
        }

        let (runtime_errors, analysis) = match self.deployment() {
            Some(deployment) => {
                let errors = deployment.fetch_runtime_errors(false).await;
                let analysis = deployment.run_static_analysis(None).await;
                (errors, analysis)
            }
            None => Default::default(),
        };

        if !runtime_errors.is_empty() || !analysis.typecheck.issues.is_empty() {
            let content = format!(
                "The generated app still has {} runtime error(s) and {} typecheck issue(s). \
                 Launch deep_debug to investigate and fix them.",
                runtime_errors.len(),
                analysis.typecheck.issues.len()
            );
            let session_id = self.state.lock().await.session_id.clone();
            let message = ConversationMessage::new(
                format!("review-{}", short_id(8)),
                MessageRole::Assistant,
                content.clone(),
            );
            if let Err(e) = self.conversations.add(&session_id, message) {
                warn!(agent_id = %self.agent_id, "failed to log review message: {e:#}");
            }
            self.broadcast(
                WsMessageType::ConversationResponse,
                json!({ "message": content }),
            );
        }

        self.state.lock().await.dev_state = DevState::Idle;
        Ok(())
    }

    // ── Operation context ────────────────────────────────────────────────

    /// Snapshot the agent into an operation context. `fetch_issues` pulls
    /// runtime errors + static analysis; `drain_user` consumes the pending
    /// user inputs and images into the context.
    async fn operation_context(&self, fetch_issues: bool, drain_user: bool) -> OperationContext {
        let (query, blueprint, user_id) = {
            let state = self.state.lock().await;
            (state.query.clone(), state.blueprint.clone(), state.user_id.clone())
        };

        let deployment = self.deployment();
        let template = deployment.as_ref().map(|d| d.template().clone());
        let excluded: Vec<String> = template
            .as_ref()
            .map(|t| {
                t.dont_touch_files
                    .iter()
                    .chain(&t.redacted_files)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let relevant_files = self.file_manager.get_relevant_files(&excluded).await;

        let (runtime_errors, static_analysis) = if fetch_issues {
            match deployment {
                Some(ref deployment) => {
                    let errors = deployment.fetch_runtime_errors(true).await;
                    if !errors.is_empty() {
                        self.broadcast(
                            WsMessageType::RuntimeErrorFound,
                            json!({ "errors": errors }),
                        );
                    }
                    let analysis = deployment.run_static_analysis(None).await;
                    self.broadcast(
                        WsMessageType::StaticAnalysisResults,
                        json!({ "analysis": analysis }),
                    );
                    (errors, analysis)
                }
                None => Default::default(),
            }
        } else {
            Default::default()
        };

        let (user_inputs, user_images) = if drain_user {
            let inputs = {
                let mut state = self.state.lock().await;
                std::mem::take(&mut state.pending_user_inputs)
            };
            let images = {
                let mut guard = self.pending_images.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *guard)
            };
            (inputs, images)
        } else {
            (Vec::new(), Vec::new())
        };

        OperationContext {
            query,
            blueprint,
            template,
            relevant_files,
            runtime_errors,
            static_analysis,
            user_inputs,
            user_images,
            inference: InferenceContext {
                client: Arc::clone(&self.inference_client),
                model: self.config.model.clone(),
                user_id,
                abort: self.acquire_abort(),
            },
        }
    }

    // ── Command execution ────────────────────────────────────────────────

    /// Run commands in chunks of five. Install commands retry up to three
    /// times and then consult the setup assistant for alternatives; other
    /// commands run once. Only successful commands enter the history.
    pub async fn execute_commands(self: &Arc<Self>, commands: &[String], ai_retries: bool) -> Result<()> {
        let Some(deployment) = self.deployment() else {
            warn!(agent_id = %self.agent_id, "no deployment, skipping {} command(s)", commands.len());
            return Ok(());
        };
        let Some(sandbox) = deployment.sandbox().await else {
            warn!(agent_id = %self.agent_id, "no sandbox instance, skipping {} command(s)", commands.len());
            return Ok(());
        };

        let mut executed: Vec<String> = Vec::new();
        for chunk in commands.chunks(COMMAND_CHUNK_SIZE) {
            for command in chunk {
                self.broadcast(
                    WsMessageType::CommandExecuting,
                    json!({ "command": command }),
                );
                let install = is_install_command(command);
                let attempts = if install && ai_retries { INSTALL_COMMAND_RETRIES } else { 1 };

                let mut last_error = String::new();
                let mut succeeded = false;
                for attempt in 0..attempts {
                    let result = sandbox
                        .exec(command, ExecOptions { timeout: Some(COMMAND_TIMEOUT), ..Default::default() })
                        .await?;
                    if result.success() {
                        succeeded = true;
                        executed.push(command.clone());
                        break;
                    }
                    last_error = result.combined_output();
                    warn!(
                        agent_id = %self.agent_id,
                        command, attempt, "command failed: {}",
                        last_error.chars().take(200).collect::<String>()
                    );
                }

                if !succeeded && install && ai_retries {
                    let ctx = self.operation_context(false, false).await;
                    match operations::setup::suggest_alternative_commands(&ctx, command, &last_error)
                        .await
                    {
                        Ok(alternatives) => {
                            for alternative in alternatives {
                                let result = sandbox
                                    .exec(
                                        &alternative,
                                        ExecOptions { timeout: Some(COMMAND_TIMEOUT), ..Default::default() },
                                    )
                                    .await?;
                                if result.success() {
                                    executed.push(alternative);
                                    succeeded = true;
                                    break;
                                }
                            }
                        }
                        Err(e) if is_cancelled(&e) || is_rate_limited(&e) => return Err(e),
                        Err(e) => warn!(agent_id = %self.agent_id, "setup assistant failed: {e:#}"),
                    }
                }

                if !succeeded && !install {
                    // Non-install failures are not retried.
                    warn!(agent_id = %self.agent_id, command, "command failed, continuing");
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            merge_history(&mut state.commands_history, &executed);
        }
        if executed.iter().any(|c| is_install_command(c)) {
            if let Err(e) = self.sync_package_json().await {
                warn!(agent_id = %self.agent_id, "package.json sync failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn run_delete_commands(&self, commands: &[String]) {
        let sandbox = match self.deployment() {
            Some(deployment) => deployment.sandbox().await,
            None => None,
        };
        for command in commands {
            let paths = paths_in_delete_command(command);
            if !paths.is_empty() {
                self.file_manager.delete_files(&paths).await;
            }
            if let Some(ref sandbox) = sandbox {
                if let Err(e) = sandbox
                    .exec(command, ExecOptions { timeout: Some(COMMAND_TIMEOUT), ..Default::default() })
                    .await
                {
                    warn!(agent_id = %self.agent_id, command, "delete command failed: {e:#}");
                }
            }
        }
    }

    /// After install-family commands, diff the sandbox's package.json
    /// against the last observed manifest and persist any drift.
    async fn sync_package_json(&self) -> Result<()> {
        let Some(deployment) = self.deployment() else { return Ok(()) };
        let Some(sandbox) = deployment.sandbox().await else { return Ok(()) };

        let manifest = match sandbox.read_file("package.json").await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return Ok(()),
        };
        {
            let state = self.state.lock().await;
            if state.last_package_json == manifest {
                return Ok(());
            }
        }

        let saved = self
            .file_manager
            .save_file(
                "package.json",
                &manifest,
                "package manifest",
                "chore: sync package.json dependencies from sandbox",
            )
            .await?;
        self.state.lock().await.last_package_json = manifest;
        self.broadcast(
            WsMessageType::FileGenerated,
            json!({ "path": saved.file_path, "diff": saved.last_diff }),
        );
        Ok(())
    }

    // ── Self-repair ──────────────────────────────────────────────────────

    /// Always-on validation pass: static analysis, `bun install` for
    /// missing external modules, and the pure fixer over typecheck issues.
    async fn deterministic_code_fixes(self: &Arc<Self>) -> Result<()> {
        let Some(deployment) = self.deployment() else { return Ok(()) };
        self.broadcast(WsMessageType::DeterministicCodeFixStarted, json!({}));

        let analysis = deployment.run_static_analysis(None).await;
        self.broadcast(
            WsMessageType::StaticAnalysisResults,
            json!({ "analysis": analysis }),
        );

        let missing = operations::regen::missing_modules_from_issues(&analysis.typecheck.issues);
        if !missing.is_empty() {
            let installs: Vec<String> = missing
                .iter()
                .map(|module| format!("bun install {module}"))
                .collect();
            self.execute_commands(&installs, false).await?;
        }

        let files = self.file_manager.get_all_files().await;
        let fixed = operations::regen::deterministic_fix(&files, &analysis.typecheck.issues);
        if !fixed.is_empty() {
            let to_save: Vec<(String, String, String)> = fixed
                .iter()
                .map(|f| (f.path.clone(), f.contents.clone(), f.purpose.clone()))
                .collect();
            let (saved, _) = self
                .file_manager
                .save_many(&to_save, "fix: deterministic code fixes")
                .await?;
            let redeploy_files: Vec<(String, String)> = saved
                .iter()
                .map(|f| (f.file_path.clone(), f.file_contents.clone()))
                .collect();
            deployment
                .deploy_to_sandbox(&redeploy_files, false, "fix: deterministic code fixes", false, &self.deploy_hook())
                .await?;
        }

        self.broadcast(
            WsMessageType::DeterministicCodeFixCompleted,
            json!({ "modulesInstalled": missing, "filesFixed": fixed.len() }),
        );
        Ok(())
    }

    /// One smart-fixer LLM pass over all relevant files and current issues.
    async fn fast_smart_fixes(self: &Arc<Self>) -> Result<()> {
        let ctx = self.operation_context(true, false).await;
        if ctx.runtime_errors.is_empty()
            && ctx.static_analysis.lint.issues.is_empty()
            && ctx.static_analysis.typecheck.issues.is_empty()
        {
            return Ok(());
        }
        let fixed = operations::regen::fast_smart_fix(&ctx).await?;
        if fixed.is_empty() {
            return Ok(());
        }
        let to_save: Vec<(String, String, String)> = fixed
            .iter()
            .map(|f| (f.path.clone(), f.contents.clone(), f.purpose.clone()))
            .collect();
        let (saved, _) = self
            .file_manager
            .save_many(&to_save, "fix: fast code fixes")
            .await?;
        if let Some(deployment) = self.deployment() {
            let files: Vec<(String, String)> = saved
                .iter()
                .map(|f| (f.file_path.clone(), f.file_contents.clone()))
                .collect();
            deployment
                .deploy_to_sandbox(&files, false, "fix: fast code fixes", false, &self.deploy_hook())
                .await?;
        }
        Ok(())
    }

    /// Regenerate one file. The caller increments `retry_index` across
    /// attempts (bounded at three by convention).
    pub async fn regenerate_file(self: &Arc<Self>, path: &str, retry_index: u32) -> Result<FileState> {
        let file = self
            .file_manager
            .get_file(path)
            .await
            .ok_or_else(|| anyhow!("no such generated file: {path}"))?;
        self.broadcast(WsMessageType::FileRegenerating, json!({ "path": path }));

        let ctx = self.operation_context(true, false).await;
        let generated = operations::regen::regenerate_file(&ctx, &file, retry_index).await?;
        let saved = self
            .file_manager
            .save_file(
                &generated.path,
                &generated.contents,
                &generated.purpose,
                &format!("fix: regenerate {}", generated.path),
            )
            .await?;
        self.broadcast(
            WsMessageType::FileRegenerated,
            json!({ "path": saved.file_path, "diff": saved.last_diff }),
        );
        Ok(saved)
    }

    // ── Deep debug ───────────────────────────────────────────────────────

    /// Launch a deep-debug session: a parallel, tool-using conversation
    /// that proposes and applies fixes for accumulated issues. At most one
    /// runs at a time; the transcript is stored even on failure.
    pub async fn deep_debug(self: &Arc<Self>, focus: String) -> Result<String> {
        if self.deep_debug_running.swap(true, Ordering::AcqRel) {
            return Err(anyhow!("a deep debug session is already running"));
        }
        let conversation_id = format!("deep-debug-{}", short_id(8));
        let agent = Arc::clone(self);
        let id = conversation_id.clone();
        tokio::spawn(async move {
            let transcript = match agent.deep_debug_inner(&id, &focus).await {
                Ok(transcript) => transcript,
                Err(e) => format!("deep debug failed: {e:#}"),
            };
            agent.state.lock().await.last_deep_debug_transcript = Some(transcript);
            agent.persist_state().await;
            agent.deep_debug_running.store(false, Ordering::Release);
        });
        Ok(conversation_id)
    }

    async fn deep_debug_inner(self: &Arc<Self>, conversation_id: &str, focus: &str) -> Result<String> {
        let ctx = self.operation_context(true, false).await;
        let output = operations::simple::simple_code_gen(&ctx, focus).await?;

        if !output.files.is_empty() {
            let to_save: Vec<(String, String, String)> = output
                .files
                .iter()
                .map(|f| (f.path.clone(), f.contents.clone(), f.purpose.clone()))
                .collect();
            let (saved, _) = self
                .file_manager
                .save_many(&to_save, "fix: deep debug changes")
                .await?;
            if let Some(deployment) = self.deployment() {
                let files: Vec<(String, String)> = saved
                    .iter()
                    .map(|f| (f.file_path.clone(), f.file_contents.clone()))
                    .collect();
                deployment
                    .deploy_to_sandbox(&files, false, "fix: deep debug changes", false, &self.deploy_hook())
                    .await?;
            }
        }

        let session_id = self.state.lock().await.session_id.clone();
        let message = ConversationMessage::new(
            conversation_id,
            MessageRole::Assistant,
            output.explanation.clone(),
        );
        self.conversations.add(&session_id, message)?;
        self.broadcast(
            WsMessageType::ConversationResponse,
            json!({ "conversationId": conversation_id, "message": output.explanation }),
        );
        Ok(output.explanation)
    }

    // ── Conversation ─────────────────────────────────────────────────────

    pub async fn process_conversation_message(self: &Arc<Self>, text: &str) -> Result<String> {
        let session_id = self.state.lock().await.session_id.clone();
        let history = self.conversations.get(&session_id)?.running;
        self.conversations.add(
            &session_id,
            ConversationMessage::new(format!("user-{}", short_id(8)), MessageRole::User, text),
        )?;

        let ctx = self.operation_context(false, false).await;
        let response = operations::conversation::process_user_message(&ctx, &history, text).await?;

        let conversation_id = format!("assistant-{}", short_id(8));
        self.conversations.add(
            &session_id,
            ConversationMessage::new(&conversation_id, MessageRole::Assistant, response.clone()),
        )?;
        self.broadcast(
            WsMessageType::ConversationResponse,
            json!({ "conversationId": conversation_id, "message": response }),
        );
        Ok(response)
    }

    pub async fn clear_conversation(&self) -> Result<()> {
        let session_id = self.state.lock().await.session_id.clone();
        self.conversations.clear(&session_id)?;
        self.broadcast(WsMessageType::ConversationCleared, json!({}));
        Ok(())
    }

    // ── Blueprint mutations ──────────────────────────────────────────────

    /// Apply a patch to the blueprint, ignoring any key outside the fixed
    /// allow-list. `projectName` goes through `update_project_name`.
    pub async fn update_blueprint(&self, patch: &Value) -> Result<Blueprint> {
        const ALLOWED: &[&str] = &[
            "title",
            "description",
            "detailedDescription",
            "colorPalette",
            "views",
            "userFlow",
            "dataFlow",
            "architecture",
            "pitfalls",
            "frameworks",
            "implementationRoadmap",
        ];

        let mut state = self.state.lock().await;
        let blueprint = state
            .blueprint
            .as_ref()
            .ok_or_else(|| anyhow!("agent has no blueprint"))?;
        let mut merged = serde_json::to_value(blueprint)?;
        if let (Some(target), Some(source)) = (merged.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                if ALLOWED.contains(&key.as_str()) {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        let updated: Blueprint = serde_json::from_value(merged).context("blueprint patch did not merge")?;
        state.blueprint = Some(updated.clone());
        Ok(updated)
    }

    /// Validate and apply a new project name, cascading to the sandbox
    /// manifest and the app record.
    pub async fn update_project_name(&self, name: &str) -> Result<()> {
        let valid = Regex::new(r"^[a-z0-9-_]{3,50}$")
            .map(|re| re.is_match(name))
            .unwrap_or(false);
        if !valid {
            return Err(anyhow!("invalid project name: {name}"));
        }

        {
            let mut state = self.state.lock().await;
            state.project_name = name.to_string();
            if let Some(ref mut blueprint) = state.blueprint {
                blueprint.project_name = name.to_string();
            }
        }
        if let Err(e) = self.app_service.update_project_name(&self.agent_id, name) {
            warn!(agent_id = %self.agent_id, "project name db cascade failed: {e:#}");
        }

        if let Some(deployment) = self.deployment() {
            if let Some(sandbox) = deployment.sandbox().await {
                if let Ok(bytes) = sandbox.read_file("package.json").await {
                    if let Ok(mut manifest) =
                        serde_json::from_slice::<serde_json::Map<String, Value>>(&bytes)
                    {
                        manifest.insert("name".to_string(), Value::String(name.to_string()));
                        if let Ok(updated) = serde_json::to_vec_pretty(&manifest) {
                            sandbox.write_file("package.json", &updated).await.ok();
                        }
                    }
                }
            }
        }
        self.persist_state().await;
        Ok(())
    }

    // ── GitHub token cache ───────────────────────────────────────────────

    /// In-memory only; wiped on restart.
    pub fn set_github_token(&self, token: Option<String>) {
        let mut guard = self.github_token.lock().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }

    pub fn github_token(&self) -> Option<String> {
        self.github_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── Snapshot / persistence ───────────────────────────────────────────

    /// Full state for the `agent_connected` handshake.
    pub async fn get_full_state(&self) -> Value {
        let state = self.state.lock().await.clone();
        let template = self.deployment().map(|d| {
            let t = d.template();
            json!({
                "name": t.name,
                "description": t.description,
                "frameworks": t.frameworks,
            })
        });
        let preview_url = match self.deployment() {
            Some(deployment) => deployment.preview_url().await,
            None => None,
        };
        let conversation = self
            .conversations
            .get(&state.session_id)
            .map(|h| h.running)
            .unwrap_or_default();
        let generated_paths = self.file_manager.get_generated_paths().await;
        json!({
            "state": state,
            "template": template,
            "previewUrl": preview_url,
            "conversation": conversation,
            "generatedPaths": generated_paths,
        })
    }

    pub async fn state_snapshot(&self) -> AgentState {
        self.state.lock().await.clone()
    }

    async fn fold_project_updates(&self) {
        let updates = self.hub.drain_project_updates();
        if !updates.is_empty() {
            self.state.lock().await.project_updates.extend(updates);
        }
    }

    pub async fn persist_state(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.generated_files = self.file_manager.snapshot().await;
            state.clone()
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.db.save_agent_state(&self.agent_id, &json) {
                    warn!(agent_id = %self.agent_id, "failed to persist state: {e:#}");
                }
            }
            Err(e) => warn!(agent_id = %self.agent_id, "failed to serialize state: {e:#}"),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Lowercase, non-alphanumerics collapsed to `-`, stem capped at 20 chars,
/// suffixed with a fresh random id.
pub fn derive_project_name(preferred: &str, title: &str) -> String {
    let source = if preferred.trim().is_empty() { title } else { preferred };
    let mut stem = String::new();
    let mut last_dash = false;
    for c in source.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            stem.push(c);
            last_dash = false;
        } else if !last_dash && !stem.is_empty() {
            stem.push('-');
            last_dash = true;
        }
        if stem.len() >= PROJECT_NAME_MAX_STEM {
            break;
        }
    }
    let stem = stem.trim_matches('-');
    let stem = if stem.is_empty() { "app" } else { stem };
    format!("{stem}-{}", short_id(6))
}

/// Project-specific rewrites of template configuration files: manifest
/// name, wrangler-style config, bootstrap script header, .gitignore.
fn customize_template_files(
    template: &vibesdk_core::types::TemplateDetails,
    project_name: &str,
) -> Vec<(String, String, String)> {
    let mut customized = Vec::new();

    if let Some(manifest) = template.file("package.json") {
        if let Ok(mut parsed) =
            serde_json::from_str::<serde_json::Map<String, Value>>(&manifest.contents)
        {
            parsed.insert("name".to_string(), Value::String(project_name.to_string()));
            if let Ok(pretty) = serde_json::to_string_pretty(&parsed) {
                customized.push(("package.json".to_string(), pretty, "package manifest".to_string()));
            }
        }
    }

    for config_path in ["wrangler.jsonc", "wrangler.toml"] {
        if let Some(config) = template.file(config_path) {
            let rewritten = rewrite_name_field(&config.contents, project_name);
            customized.push((config_path.to_string(), rewritten, "deployment config".to_string()));
        }
    }

    if let Some(bootstrap) = template.file(".bootstrap.js") {
        let header = format!("const PROJECT_NAME = {project_name:?};\n");
        customized.push((
            ".bootstrap.js".to_string(),
            format!("{header}{}", bootstrap.contents),
            "bootstrap script".to_string(),
        ));
    }

    let gitignore = template
        .file(".gitignore")
        .map(|f| f.contents.clone())
        .unwrap_or_default();
    let mut lines: Vec<&str> = gitignore.lines().collect();
    for required in ["node_modules", "dist", ".env"] {
        if !lines.contains(&required) {
            lines.push(required);
        }
    }
    customized.push((
        ".gitignore".to_string(),
        format!("{}\n", lines.join("\n")),
        "ignore rules".to_string(),
    ));

    customized
}

fn rewrite_name_field(contents: &str, project_name: &str) -> String {
    match Regex::new(r#""name"\s*:\s*"[^"]*""#) {
        Ok(re) if re.is_match(contents) => re
            .replace(contents, format!("\"name\": \"{project_name}\""))
            .into_owned(),
        _ => match Regex::new(r#"(?m)^name\s*=\s*"[^"]*""#) {
            Ok(re) => re
                .replace(contents, format!("name = \"{project_name}\""))
                .into_owned(),
            Err(_) => contents.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names_are_slugged_and_suffixed() {
        let name = derive_project_name("", "My Great Todo List App With Extras");
        let (stem, suffix) = name.rsplit_once('-').expect("suffix");
        assert!(stem.len() <= PROJECT_NAME_MAX_STEM);
        assert_eq!(suffix.len(), 6);
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(name.starts_with("my-great-todo"));
    }

    #[test]
    fn empty_titles_still_produce_a_name() {
        let name = derive_project_name("", "!!!");
        assert!(name.starts_with("app-"));
    }

    #[test]
    fn wrangler_name_fields_are_rewritten() {
        let jsonc = rewrite_name_field("{\n  \"name\": \"template\"\n}", "demo-x1");
        assert!(jsonc.contains("\"name\": \"demo-x1\""));
        let toml = rewrite_name_field("name = \"template\"\nmain = \"index.ts\"", "demo-x1");
        assert!(toml.contains("name = \"demo-x1\""));
    }
}
