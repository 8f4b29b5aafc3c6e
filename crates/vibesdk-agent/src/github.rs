//! GitHub export: replay the local commit history onto a remote repository
//! through the REST blobs/trees/commits/refs API, deduplicating blob
//! uploads by content hash, then force-update the default branch.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{info, warn};

use vibesdk_core::db::Db;
use vibesdk_core::types::CommitInfo;
use vibesdk_core::workspace::{GitObjectExport, Workspace};

use crate::agent::CodeGenAgent;
use crate::websocket::WsMessageType;

pub const CLOUDFLARE_BUTTON_PLACEHOLDER: &str = "[cloudflarebutton]";
const CLOUDFLARE_BUTTON_COMMIT: &str = "docs: Add Cloudflare deploy button to README";

#[derive(Debug, Clone)]
pub struct GithubExportRequest {
    /// `https://github.com/{owner}/{repo}` (an optional trailing `.git` is
    /// tolerated).
    pub repo_url: String,
    pub token: String,
    pub default_branch: String,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone)]
pub struct GithubExportResult {
    pub commits_pushed: usize,
    pub blobs_created: usize,
    pub branch: String,
    pub last_oid: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub compatible: bool,
    pub behind_by: usize,
    pub ahead_by: usize,
    pub diverged_commits: Vec<String>,
}

pub type ExportProgressHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

pub struct GithubExporter {
    api_base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Deserialize)]
struct RemoteCommit {
    commit: RemoteCommitBody,
}

#[derive(Deserialize)]
struct RemoteCommitBody {
    message: String,
}

fn parse_repo_url(repo_url: &str) -> Result<(String, String)> {
    let trimmed = repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let mut parts = trimmed.split('/');
    let host = parts.next().unwrap_or_default();
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();
    if host.is_empty() || owner.is_empty() || repo.is_empty() {
        return Err(anyhow!("cannot parse repository url: {repo_url}"));
    }
    Ok((owner.to_string(), repo.to_string()))
}

fn content_sha(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    hex::encode(hasher.finalize())
}

impl GithubExporter {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            client: reqwest::Client::builder()
                .user_agent("vibesdk-export")
                .build()
                .unwrap_or_default(),
        }
    }

    fn repo_endpoint(&self, owner: &str, repo: &str, path: &str) -> String {
        format!(
            "{}/repos/{owner}/{repo}/{path}",
            self.api_base.trim_end_matches('/')
        )
    }

    async fn post_json(&self, url: &str, token: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("POST {url} returned {status}: {value}"));
        }
        Ok(value)
    }

    /// Replay the exported objects onto the remote. Blobs are created only
    /// for contents not seen before in this run (`blob_cache` dedup);
    /// original timestamps and authorship are preserved.
    pub async fn export(
        &self,
        objects: &[GitObjectExport],
        request: &GithubExportRequest,
        progress: &ExportProgressHook,
    ) -> Result<GithubExportResult> {
        let (owner, repo) = parse_repo_url(&request.repo_url)?;
        let workspace = build_replay_workspace(objects)?;
        prepare_readme(&workspace, &request.repo_url)?;

        let mut commits: Vec<CommitInfo> = workspace.log(1_000);
        commits.reverse(); // oldest → newest

        if commits.is_empty() {
            return Err(anyhow!("nothing to export: local history is empty"));
        }

        let mut blob_cache: HashMap<String, String> = HashMap::new();
        let mut blobs_created = 0usize;
        let mut previous_oid: Option<String> = None;
        let total = commits.len();

        for (index, commit) in commits.iter().enumerate() {
            let files = workspace.read_files_from_commit(&commit.oid)?;

            // Create missing blobs in parallel, keyed by content hash.
            let mut pending: HashMap<String, String> = HashMap::new();
            for (_, contents) in &files {
                let key = content_sha(contents);
                if !blob_cache.contains_key(&key) {
                    pending.entry(key).or_insert_with(|| contents.clone());
                }
            }
            let mut tasks: JoinSet<Result<(String, String)>> = JoinSet::new();
            for (key, contents) in pending {
                let url = self.repo_endpoint(&owner, &repo, "git/blobs");
                let client = self.client.clone();
                let token = request.token.clone();
                tasks.spawn(async move {
                    let body = json!({
                        "content": base64::engine::general_purpose::STANDARD.encode(contents),
                        "encoding": "base64",
                    });
                    let response = client
                        .post(&url)
                        .bearer_auth(&token)
                        .header("Accept", "application/vnd.github+json")
                        .json(&body)
                        .send()
                        .await
                        .context("create blob")?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(anyhow!("create blob returned {status}"));
                    }
                    let parsed: ShaResponse = response.json().await.context("parse blob sha")?;
                    Ok((key, parsed.sha))
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let (key, sha) = joined.context("blob task panicked")??;
                blob_cache.insert(key, sha);
                blobs_created += 1;
            }

            let tree_entries: Vec<Value> = files
                .iter()
                .map(|(path, contents)| {
                    let sha = blob_cache.get(&content_sha(contents)).cloned().unwrap_or_default();
                    json!({ "path": path, "mode": "100644", "type": "blob", "sha": sha })
                })
                .collect();
            let tree = self
                .post_json(
                    &self.repo_endpoint(&owner, &repo, "git/trees"),
                    &request.token,
                    json!({ "tree": tree_entries }),
                )
                .await?;
            let tree_sha = tree
                .get("sha")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("tree response had no sha"))?
                .to_string();

            let date = chrono::DateTime::from_timestamp(commit.timestamp / 1000, 0)
                .unwrap_or_else(chrono::Utc::now)
                .to_rfc3339();
            let identity = json!({
                "name": request.author_name,
                "email": request.author_email,
                "date": date,
            });
            let parents: Vec<&String> = previous_oid.iter().collect();
            let created = self
                .post_json(
                    &self.repo_endpoint(&owner, &repo, "git/commits"),
                    &request.token,
                    json!({
                        "message": commit.message,
                        "tree": tree_sha,
                        "parents": parents,
                        "author": identity,
                        "committer": identity,
                    }),
                )
                .await?;
            let commit_sha = created
                .get("sha")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("commit response had no sha"))?
                .to_string();
            previous_oid = Some(commit_sha);
            progress(index + 1, total);
        }

        let last_oid = previous_oid.ok_or_else(|| anyhow!("no commits were pushed"))?;
        self.force_update_ref(&owner, &repo, &request.default_branch, &last_oid, &request.token)
            .await?;

        info!(
            owner,
            repo,
            commits = total,
            blobs = blobs_created,
            "github export complete"
        );
        Ok(GithubExportResult {
            commits_pushed: total,
            blobs_created,
            branch: request.default_branch.clone(),
            last_oid,
        })
    }

    async fn force_update_ref(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        sha: &str,
        token: &str,
    ) -> Result<()> {
        let url = self.repo_endpoint(owner, repo, &format!("git/refs/heads/{branch}"));
        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "sha": sha, "force": true }))
            .send()
            .await
            .context("update ref")?;
        if response.status().is_success() {
            return Ok(());
        }
        // The ref may not exist yet on a fresh repository.
        self.post_json(
            &self.repo_endpoint(owner, repo, "git/refs"),
            token,
            json!({ "ref": format!("refs/heads/{branch}"), "sha": sha }),
        )
        .await
        .map(|_| ())
    }

    /// Compare remote history with the local one by normalized commit
    /// message, ignoring the synthetic deploy-button commit on the remote.
    pub async fn check_remote_status(
        &self,
        request: &GithubExportRequest,
        local_log: &[CommitInfo],
    ) -> Result<RemoteStatus> {
        let (owner, repo) = parse_repo_url(&request.repo_url)?;
        let url = format!(
            "{}?sha={}&per_page=100",
            self.repo_endpoint(&owner, &repo, "commits"),
            request.default_branch
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&request.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("list remote commits")?;
        let remote: Vec<RemoteCommit> = if response.status().is_success() {
            response.json().await.unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut remote_messages: Vec<String> = remote
            .into_iter()
            .map(|c| c.commit.message.trim().to_string())
            .filter(|m| !m.starts_with(CLOUDFLARE_BUTTON_COMMIT))
            .collect();
        remote_messages.reverse(); // oldest → newest

        let local_messages: Vec<String> = local_log
            .iter()
            .rev()
            .map(|c| c.message.trim().to_string())
            .collect();

        Ok(compare_histories(&local_messages, &remote_messages))
    }
}

fn compare_histories(local: &[String], remote: &[String]) -> RemoteStatus {
    let common = local
        .iter()
        .zip(remote.iter())
        .take_while(|(l, r)| l == r)
        .count();
    // Local commits occupying positions where the remote has a different
    // commit.
    let diverged: Vec<String> = local[common..]
        .iter()
        .zip(remote[common..].iter())
        .map(|(l, _)| l.clone())
        .collect();
    RemoteStatus {
        compatible: common == local.len().min(remote.len()),
        behind_by: remote.len() - common,
        ahead_by: local.len() - common,
        diverged_commits: diverged,
    }
}

/// Rebuild a workspace from exported objects in a scratch database.
fn build_replay_workspace(objects: &[GitObjectExport]) -> Result<Arc<Workspace>> {
    let db = Arc::new(Db::open(":memory:")?);
    db.migrate_agent()?;
    let mut workspace = Workspace::new(db);
    workspace.init("main")?;
    let workspace = Arc::new(workspace);
    workspace.import_git_objects(objects)?;
    Ok(workspace)
}

/// Substitute the deploy-button placeholder in README.md, committing the
/// change so the remote copy renders the button.
fn prepare_readme(workspace: &Arc<Workspace>, repo_url: &str) -> Result<()> {
    let Some(head) = workspace.head_oid()? else {
        return Ok(());
    };
    let files = workspace.read_files_from_commit(&head)?;
    let Some((_, readme)) = files.iter().find(|(path, _)| path == "README.md") else {
        return Ok(());
    };
    if !readme.contains(CLOUDFLARE_BUTTON_PLACEHOLDER) {
        return Ok(());
    }
    let button = format!(
        "[![Deploy to Cloudflare](https://deploy.workers.cloudflare.com/button)](https://deploy.workers.cloudflare.com/?url={repo_url})"
    );
    let updated = readme.replace(CLOUDFLARE_BUTTON_PLACEHOLDER, &button);
    workspace.commit(
        &[("README.md".to_string(), updated)],
        CLOUDFLARE_BUTTON_COMMIT,
    )?;
    Ok(())
}

// ── Agent surface ────────────────────────────────────────────────────────

impl CodeGenAgent {
    /// Export the agent's workspace to GitHub, streaming progress over the
    /// websocket. Does not mutate agent state beyond the in-memory token
    /// cache.
    pub async fn export_to_github(
        self: &Arc<Self>,
        api_base: &str,
        request: GithubExportRequest,
    ) -> Result<GithubExportResult> {
        self.set_github_token(Some(request.token.clone()));
        self.hub().broadcast(
            WsMessageType::GithubExportStarted,
            json!({ "repoUrl": request.repo_url }),
        );

        let objects = self.file_manager().workspace().export_git_objects()?;
        let exporter = GithubExporter::new(api_base);
        let hub = Arc::clone(self.hub());
        let progress: ExportProgressHook = Arc::new(move |done, total| {
            hub.broadcast(
                WsMessageType::GithubExportProgress,
                json!({ "done": done, "total": total }),
            );
        });

        match exporter.export(&objects, &request, &progress).await {
            Ok(result) => {
                self.hub().broadcast(
                    WsMessageType::GithubExportCompleted,
                    json!({
                        "commitsPushed": result.commits_pushed,
                        "branch": result.branch,
                    }),
                );
                Ok(result)
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id(), "github export failed: {e:#}");
                self.hub().broadcast(
                    WsMessageType::GithubExportError,
                    json!({ "message": format!("{e:#}") }),
                );
                Err(e)
            }
        }
    }
}
