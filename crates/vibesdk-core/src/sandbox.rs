//! Command/file sandbox for builds and preview.
//!
//! The trait abstracts command execution, file I/O, process lifecycle and
//! port exposure; `LocalSandbox` is the concrete backend that runs commands
//! locally under a chroot-like path guard rooted at the instance directory.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::PathTraversal;
use crate::ids::short_id;
use crate::types::SandboxInstanceMetadata;

/// Name of the log file dev processes write into, relative to the instance
/// root. The deployment manager harvests runtime errors from it.
pub const RUNTIME_LOG: &str = "runtime.log";

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory relative to the instance root.
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub command: String,
    pub running: bool,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecResult>;
    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn remove_path(&self, path: &str) -> Result<()>;
    async fn start_process(&self, cmd: &str, opts: ExecOptions) -> Result<String>;
    async fn get_process(&self, id: &str) -> Option<ProcessInfo>;
    async fn kill_process(&self, id: &str) -> Result<()>;
    async fn list_processes(&self) -> Vec<ProcessInfo>;
    async fn expose_port(&self, port: u16) -> Result<String>;
    async fn unexpose_port(&self, port: u16);
    async fn get_exposed_ports(&self) -> Vec<u16>;
    async fn set_env_vars(&self, vars: HashMap<String, String>);
    /// Write a file set plus `metadata.json` into the instance.
    async fn deploy(&self, files: &[(String, Vec<u8>)], instance: &SandboxInstanceMetadata) -> Result<()>;
}

struct ProcessEntry {
    command: String,
    child: tokio::process::Child,
    started_at: DateTime<Utc>,
}

pub struct LocalSandbox {
    root: PathBuf,
    host: String,
    processes: Mutex<HashMap<String, ProcessEntry>>,
    ports: Mutex<HashMap<u16, String>>,
    env: Mutex<HashMap<String, String>>,
}

/// Reject any path whose components contain `..` (or an absolute prefix)
/// before it ever reaches the filesystem.
pub fn guard_path(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = path.trim_start_matches('/');
    let candidate = Path::new(relative);
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(anyhow!(PathTraversal {
                    path: path.to_string(),
                }))
            }
        }
    }
    Ok(root.join(candidate))
}

impl LocalSandbox {
    /// Create a sandbox rooted at `instances_dir/<instance_id>`.
    pub fn provision(instances_dir: &Path, instance_id: &str, host: &str) -> Result<Self> {
        let root = instances_dir.join(instance_id);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create instance dir {}", root.display()))?;
        Ok(Self {
            root,
            host: host.to_string(),
            processes: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            env: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runtime_log_path(&self) -> PathBuf {
        self.root.join(RUNTIME_LOG)
    }

    async fn build_command(&self, cmd: &str, opts: &ExecOptions) -> Result<Command> {
        let cwd = match &opts.cwd {
            Some(dir) => guard_path(&self.root, dir)?,
            None => self.root.clone(),
        };
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(cwd);
        for (k, v) in self.env.lock().await.iter() {
            command.env(k, v);
        }
        Ok(command)
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecResult> {
        let mut command = self.build_command(cmd, &opts).await?;
        let run = command.output();

        let output = match opts.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(cmd, timeout_s = timeout.as_secs(), "sandbox command timed out");
                    return Ok(ExecResult {
                        stdout: String::new(),
                        stderr: format!("command timed out after {}s", timeout.as_secs()),
                        exit_code: 124,
                    });
                }
            },
            None => run.await,
        }
        .with_context(|| format!("failed to spawn: {cmd}"))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = guard_path(&self.root, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = guard_path(&self.root, path)?;
        tokio::fs::read(&target)
            .await
            .with_context(|| format!("failed to read {}", target.display()))
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        let target = guard_path(&self.root, path)?;
        if target.is_dir() {
            tokio::fs::remove_dir_all(&target).await.ok();
        } else {
            tokio::fs::remove_file(&target).await.ok();
        }
        Ok(())
    }

    async fn start_process(&self, cmd: &str, opts: ExecOptions) -> Result<String> {
        let mut command = self.build_command(cmd, &opts).await?;

        // Detached: output goes to the instance's runtime log, which
        // fetch_runtime_errors later parses.
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.runtime_log_path())
            .context("failed to open runtime log")?;
        let log_err = log.try_clone().context("failed to clone runtime log handle")?;
        command
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);

        let child = command
            .spawn()
            .with_context(|| format!("failed to start process: {cmd}"))?;

        let id = short_id(10);
        info!(process_id = %id, cmd, "sandbox process started");
        self.processes.lock().await.insert(
            id.clone(),
            ProcessEntry {
                command: cmd.to_string(),
                child,
                started_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_process(&self, id: &str) -> Option<ProcessInfo> {
        let mut processes = self.processes.lock().await;
        let entry = processes.get_mut(id)?;
        let running = matches!(entry.child.try_wait(), Ok(None));
        Some(ProcessInfo {
            id: id.to_string(),
            command: entry.command.clone(),
            running,
            started_at: entry.started_at,
        })
    }

    async fn kill_process(&self, id: &str) -> Result<()> {
        let mut processes = self.processes.lock().await;
        let mut entry = processes
            .remove(id)
            .ok_or_else(|| anyhow!("no such process: {id}"))?;
        entry.child.start_kill().ok();
        info!(process_id = %id, "sandbox process killed");
        Ok(())
    }

    async fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut processes = self.processes.lock().await;
        let mut infos = Vec::with_capacity(processes.len());
        for (id, entry) in processes.iter_mut() {
            let running = matches!(entry.child.try_wait(), Ok(None));
            infos.push(ProcessInfo {
                id: id.clone(),
                command: entry.command.clone(),
                running,
                started_at: entry.started_at,
            });
        }
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        infos
    }

    async fn expose_port(&self, port: u16) -> Result<String> {
        let url = format!("http://{}:{port}", self.host);
        self.ports.lock().await.insert(port, url.clone());
        Ok(url)
    }

    async fn unexpose_port(&self, port: u16) {
        self.ports.lock().await.remove(&port);
    }

    async fn get_exposed_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.ports.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    async fn set_env_vars(&self, vars: HashMap<String, String>) {
        self.env.lock().await.extend(vars);
    }

    async fn deploy(&self, files: &[(String, Vec<u8>)], instance: &SandboxInstanceMetadata) -> Result<()> {
        for (path, bytes) in files {
            self.write_file(path, bytes).await?;
        }
        let metadata = serde_json::to_vec_pretty(instance).context("serialize instance metadata")?;
        self.write_file("metadata.json", &metadata).await?;
        Ok(())
    }
}

/// Allocate a free local port by binding port 0 and reading the assignment.
pub fn allocate_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").context("failed to allocate port")?;
    Ok(listener.local_addr().context("failed to read local addr")?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejects_parent_components() {
        let root = Path::new("/srv/instances/abc");
        assert!(guard_path(root, "src/App.tsx").is_ok());
        assert!(guard_path(root, "/src/App.tsx").is_ok());
        let err = guard_path(root, "../other/secret").unwrap_err();
        assert!(err.downcast_ref::<PathTraversal>().is_some());
        assert!(guard_path(root, "src/../../etc/passwd").is_err());
    }
}
