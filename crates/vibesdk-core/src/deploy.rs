//! Deployment manager: provisions a sandbox instance for the project,
//! deploys generated files, runs the template bootstrap, and surfaces the
//! preview URL, runtime errors and static analysis to the agent.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ids::short_id;
use crate::sandbox::{allocate_port, ExecOptions, ExecResult, LocalSandbox, Sandbox, RUNTIME_LOG};
use crate::types::{
    AnalysisIssue, AnalysisReport, ErrorSeverity, RuntimeError, SandboxInstanceMetadata,
    StaticAnalysisResult, TemplateDetails,
};

/// Returned by `fetch_runtime_errors` while no preview is deployed.
pub const PREVIEW_NOT_DEPLOYED: &str =
    "<runtime errors not available at the moment as preview is not deployed>";

const PREVIEW_WAIT_ATTEMPTS: u32 = 30;
const PREVIEW_WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum DeployEvent {
    Started { instance_id: String, message: String },
    Completed { preview_url: String },
    Failed { message: String },
    AfterSetupCommands { commands: Vec<String> },
}

pub type DeployHook = Arc<dyn Fn(DeployEvent) + Send + Sync>;

pub fn noop_hook() -> DeployHook {
    Arc::new(|_| {})
}

pub struct SandboxInstance {
    pub sandbox: Arc<LocalSandbox>,
    pub meta: SandboxInstanceMetadata,
}

pub struct DeploymentManager {
    instances_dir: PathBuf,
    host: String,
    template: TemplateDetails,
    project_name: String,
    bootstrap_timeout: Duration,
    instance: Mutex<Option<SandboxInstance>>,
    session_id: StdMutex<String>,
}

impl DeploymentManager {
    pub fn new(
        data_dir: &str,
        host: &str,
        template: TemplateDetails,
        project_name: &str,
        bootstrap_timeout: Duration,
    ) -> Self {
        Self {
            instances_dir: PathBuf::from(data_dir).join("instances"),
            host: host.to_string(),
            template,
            project_name: project_name.to_string(),
            bootstrap_timeout,
            instance: Mutex::new(None),
            session_id: StdMutex::new(short_id(12)),
        }
    }

    pub fn template(&self) -> &TemplateDetails {
        &self.template
    }

    pub fn get_session_id(&self) -> String {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn generate_new_session_id(&self) -> String {
        let fresh = short_id(12);
        let mut guard = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
        *guard = fresh.clone();
        fresh
    }

    pub async fn sandbox(&self) -> Option<Arc<LocalSandbox>> {
        self.instance.lock().await.as_ref().map(|i| Arc::clone(&i.sandbox))
    }

    pub async fn preview_url(&self) -> Option<String> {
        self.instance
            .lock()
            .await
            .as_ref()
            .and_then(|i| i.meta.preview_url.clone())
    }

    pub async fn instance_meta(&self) -> Option<SandboxInstanceMetadata> {
        self.instance.lock().await.as_ref().map(|i| i.meta.clone())
    }

    // ── deploy ───────────────────────────────────────────────────────────

    /// Deploy `files` into the sandbox, provisioning a fresh instance when
    /// none exists (or `redeploy` forces one). A redeploy with an empty
    /// file set is a no-op that only returns the cached preview URL.
    pub async fn deploy_to_sandbox(
        self: &Arc<Self>,
        files: &[(String, String)],
        redeploy: bool,
        commit_message: &str,
        clear_logs: bool,
        on_event: &DeployHook,
    ) -> Result<Option<String>> {
        let mut guard = self.instance.lock().await;

        if let Some(instance) = guard.as_ref() {
            if !redeploy && files.is_empty() {
                return Ok(instance.meta.preview_url.clone());
            }
        }

        let result = self
            .deploy_inner(&mut guard, files, redeploy, commit_message, clear_logs, on_event)
            .await;
        if let Err(ref e) = result {
            on_event(DeployEvent::Failed {
                message: format!("{e:#}"),
            });
        }
        result
    }

    async fn deploy_inner(
        self: &Arc<Self>,
        guard: &mut Option<SandboxInstance>,
        files: &[(String, String)],
        redeploy: bool,
        commit_message: &str,
        clear_logs: bool,
        on_event: &DeployHook,
    ) -> Result<Option<String>> {
        let needs_provision = guard.is_none() || redeploy;

        if needs_provision {
            if let Some(old) = guard.take() {
                if let Some(ref pid) = old.meta.process_id {
                    old.sandbox.kill_process(pid).await.ok();
                }
            }

            let instance_id = short_id(8);
            on_event(DeployEvent::Started {
                instance_id: instance_id.clone(),
                message: commit_message.to_string(),
            });
            info!(instance_id, project = %self.project_name, "provisioning sandbox instance");

            let sandbox = Arc::new(LocalSandbox::provision(
                &self.instances_dir,
                &instance_id,
                &self.host,
            )?);

            let mut meta = SandboxInstanceMetadata {
                template_name: self.template.name.clone(),
                project_name: self.project_name.clone(),
                start_time: Some(Utc::now()),
                dont_touch_files: self.template.dont_touch_files.clone(),
                redacted_files: self.template.redacted_files.clone(),
                ..Default::default()
            };

            for file in &self.template.files {
                sandbox
                    .write_file(&file.path, file.contents.as_bytes())
                    .await?;
            }
            for (path, contents) in files {
                sandbox.write_file(path, contents.as_bytes()).await?;
            }

            if !self.template.commands.bootstrap.is_empty() {
                let result = sandbox
                    .exec(
                        &self.template.commands.bootstrap,
                        ExecOptions {
                            timeout: Some(self.bootstrap_timeout),
                            ..Default::default()
                        },
                    )
                    .await?;
                if !result.success() {
                    return Err(anyhow!(
                        "template bootstrap failed (exit {}): {}",
                        result.exit_code,
                        truncate(&result.combined_output(), 500)
                    ));
                }
            }

            let port = allocate_port()?;
            let preview_url = sandbox.expose_port(port).await?;
            if !self.template.commands.dev.is_empty() {
                sandbox
                    .set_env_vars([("PORT".to_string(), port.to_string())].into())
                    .await;
                let process_id = sandbox
                    .start_process(&self.template.commands.dev, ExecOptions::default())
                    .await?;
                meta.process_id = Some(process_id);
            }
            meta.allocated_port = Some(port);
            meta.preview_url = Some(preview_url.clone());

            sandbox.deploy(&[], &meta).await?;
            *guard = Some(SandboxInstance { sandbox, meta });

            on_event(DeployEvent::Completed {
                preview_url: preview_url.clone(),
            });
            return Ok(Some(preview_url));
        }

        // Existing instance: incremental file write.
        let instance = guard
            .as_ref()
            .ok_or_else(|| anyhow!("no sandbox instance"))?;
        let instance_id = instance
            .sandbox
            .root()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        on_event(DeployEvent::Started {
            instance_id,
            message: commit_message.to_string(),
        });
        for (path, contents) in files {
            instance.sandbox.write_file(path, contents.as_bytes()).await?;
        }
        if clear_logs {
            instance.sandbox.write_file(RUNTIME_LOG, b"").await.ok();
        }
        let preview = instance.meta.preview_url.clone();
        if let Some(ref url) = preview {
            on_event(DeployEvent::Completed {
                preview_url: url.clone(),
            });
        }
        Ok(preview)
    }

    /// Out of scope for the local backend; kept as the interface surface.
    pub async fn deploy_to_cloudflare(&self, _on_event: &DeployHook) -> Result<Option<String>> {
        info!("cloudflare deployment not configured, skipping");
        Ok(None)
    }

    /// Block until the preview is reachable (instance present with a live
    /// dev process), or fail after a bounded wait.
    pub async fn wait_for_preview(&self) -> Result<String> {
        for _ in 0..PREVIEW_WAIT_ATTEMPTS {
            {
                let guard = self.instance.lock().await;
                if let Some(instance) = guard.as_ref() {
                    if let Some(ref url) = instance.meta.preview_url {
                        let alive = match instance.meta.process_id.as_deref() {
                            Some(pid) => instance
                                .sandbox
                                .get_process(pid)
                                .await
                                .map(|p| p.running)
                                .unwrap_or(false),
                            None => true,
                        };
                        if alive {
                            return Ok(url.clone());
                        }
                    }
                }
            }
            tokio::time::sleep(PREVIEW_WAIT_INTERVAL).await;
        }
        Err(anyhow!("preview did not become available"))
    }

    // ── runtime errors ───────────────────────────────────────────────────

    /// Harvest runtime errors from the instance's dev-process log. When no
    /// preview is deployed, kick a background redeploy and return the
    /// synthetic "not available" error.
    pub async fn fetch_runtime_errors(self: &Arc<Self>, clear: bool) -> Vec<RuntimeError> {
        let sandbox = {
            let guard = self.instance.lock().await;
            match guard.as_ref() {
                Some(instance) => Arc::clone(&instance.sandbox),
                None => {
                    warn!("runtime errors requested with no deployed preview, scheduling redeploy");
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        let hook = noop_hook();
                        if let Err(e) = manager
                            .deploy_to_sandbox(&[], true, "redeploy: preview unavailable", false, &hook)
                            .await
                        {
                            warn!("background redeploy failed: {e:#}");
                        }
                    });
                    return vec![RuntimeError {
                        message: PREVIEW_NOT_DEPLOYED.to_string(),
                        timestamp: Utc::now(),
                        severity: ErrorSeverity::Error,
                        raw_output: String::new(),
                    }];
                }
            }
        };

        let raw = match sandbox.read_file(RUNTIME_LOG).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };
        if clear && !raw.is_empty() {
            sandbox.write_file(RUNTIME_LOG, b"").await.ok();
        }
        parse_runtime_log(&raw)
    }

    // ── static analysis ──────────────────────────────────────────────────

    /// Run the template's lint and typecheck commands and parse their
    /// diagnostics. Any failure degrades to empty issue lists.
    pub async fn run_static_analysis(&self, files: Option<&[String]>) -> StaticAnalysisResult {
        let Some(sandbox) = self.sandbox().await else {
            warn!("static analysis requested with no sandbox instance");
            return StaticAnalysisResult::default();
        };

        let lint = self
            .run_analysis_command(&sandbox, &self.template.commands.lint, files)
            .await;
        let typecheck = self
            .run_analysis_command(&sandbox, &self.template.commands.typecheck, None)
            .await;
        StaticAnalysisResult { lint, typecheck }
    }

    async fn run_analysis_command(
        &self,
        sandbox: &Arc<LocalSandbox>,
        command: &str,
        files: Option<&[String]>,
    ) -> AnalysisReport {
        if command.is_empty() {
            return AnalysisReport::default();
        }
        let full_command = match files {
            Some(files) if !files.is_empty() => format!("{command} {}", files.join(" ")),
            _ => command.to_string(),
        };
        let result: Result<ExecResult> = sandbox
            .exec(
                &full_command,
                ExecOptions {
                    timeout: Some(Duration::from_secs(120)),
                    ..Default::default()
                },
            )
            .await;
        match result {
            Ok(output) => {
                let issues = parse_diagnostics(&output.combined_output());
                let summary = if issues.is_empty() {
                    "no issues".to_string()
                } else {
                    format!("{} issue(s)", issues.len())
                };
                AnalysisReport { issues, summary }
            }
            Err(e) => {
                warn!(command = full_command, "static analysis failed: {e:#}");
                AnalysisReport::default()
            }
        }
    }
}

// ── parsers ──────────────────────────────────────────────────────────────

fn parse_runtime_log(raw: &str) -> Vec<RuntimeError> {
    let mut errors = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_lowercase();
        let severity = if lower.contains("fatal") || lower.contains("panic") {
            ErrorSeverity::Fatal
        } else if lower.contains("error") {
            ErrorSeverity::Error
        } else if lower.contains("warn") {
            ErrorSeverity::Warning
        } else {
            continue;
        };
        errors.push(RuntimeError {
            message: truncate(trimmed, 2_000),
            timestamp: Utc::now(),
            severity,
            raw_output: trimmed.to_string(),
        });
    }
    errors
}

/// Parse `file(line,col): [severity ]CODE: message` diagnostics, the shape
/// emitted by tsc-style checkers.
fn parse_diagnostics(output: &str) -> Vec<AnalysisIssue> {
    let Ok(re) = Regex::new(
        r"(?m)^(.+?)\((\d+),(\d+)\):\s+(?:(error|warning)\s+)?([A-Za-z]+\d+):\s+(.+)$",
    ) else {
        return Vec::new();
    };
    re.captures_iter(output)
        .map(|cap| AnalysisIssue {
            file: cap[1].trim().to_string(),
            line: cap[2].parse().unwrap_or(0),
            column: cap[3].parse().unwrap_or(0),
            severity: cap.get(4).map(|m| m.as_str()).unwrap_or("error").to_string(),
            code: cap[5].to_string(),
            message: cap[6].trim().to_string(),
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
