//! Typed overlay on the workspace keyed by logical path. Tracks a
//! `FileState` per generated file, including the unified diff of the last
//! write, which downstream file-generation callers echo back to the LLM
//! for tool-call display.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::diff::unified_diff;
use crate::types::{CommitInfo, FileState};
use crate::workspace::{normalize_path, Workspace};

/// Extensions considered code sources when filtering "relevant" files.
const CODE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "css", "html", "json", "md", "toml", "yaml", "yml", "svg",
];

pub struct FileManager {
    workspace: Arc<Workspace>,
    files: Mutex<HashMap<String, FileState>>,
}

impl FileManager {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            workspace,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub async fn get_file(&self, path: &str) -> Option<FileState> {
        let path = normalize_path(path);
        self.files.lock().await.get(&path).cloned()
    }

    pub async fn get_all_files(&self) -> Vec<FileState> {
        let mut files: Vec<FileState> = self.files.lock().await.values().cloned().collect();
        files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        files
    }

    /// Generated code sources minus redacted and do-not-touch paths.
    pub async fn get_relevant_files(&self, excluded: &[String]) -> Vec<FileState> {
        let mut files: Vec<FileState> = self
            .files
            .lock()
            .await
            .values()
            .filter(|f| is_code_source(&f.file_path))
            .filter(|f| !excluded.iter().any(|e| e == &f.file_path))
            .cloned()
            .collect();
        files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        files
    }

    pub async fn get_generated_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Write one file through to the workspace and refresh its tracked
    /// state. `last_diff` is the unified diff of previous → new contents
    /// (full-add for a first write).
    pub async fn save_file(
        &self,
        path: &str,
        contents: &str,
        purpose: &str,
        commit_message: &str,
    ) -> Result<FileState> {
        let state = self.record_file(path, contents, purpose).await;
        self.workspace
            .commit(&[(state.file_path.clone(), contents.to_string())], commit_message)?;
        Ok(state)
    }

    /// Write many files in a single commit with an aggregated message.
    /// Returns the refreshed states and the commit (None when nothing
    /// actually changed).
    pub async fn save_many(
        &self,
        files: &[(String, String, String)],
        commit_message: &str,
    ) -> Result<(Vec<FileState>, Option<CommitInfo>)> {
        let mut states = Vec::with_capacity(files.len());
        let mut to_commit = Vec::with_capacity(files.len());
        for (path, contents, purpose) in files {
            let state = self.record_file(path, contents, purpose).await;
            to_commit.push((state.file_path.clone(), contents.clone()));
            states.push(state);
        }
        let commit = self.workspace.commit(&to_commit, commit_message)?;
        Ok((states, commit))
    }

    async fn record_file(&self, path: &str, contents: &str, purpose: &str) -> FileState {
        let path = normalize_path(path);
        let mut files = self.files.lock().await;
        let previous = files.get(&path).map(|f| f.file_contents.clone()).unwrap_or_default();
        let state = FileState {
            file_path: path.clone(),
            file_contents: contents.to_string(),
            file_purpose: if purpose.is_empty() {
                files.get(&path).map(|f| f.file_purpose.clone()).unwrap_or_default()
            } else {
                purpose.to_string()
            },
            last_diff: unified_diff(&path, &previous, contents),
        };
        files.insert(path, state.clone());
        state
    }

    /// Drop files from the tracked map. Does not commit; callers issue the
    /// sandbox removal themselves.
    pub async fn delete_files(&self, paths: &[String]) -> Vec<String> {
        let mut files = self.files.lock().await;
        let mut removed = Vec::new();
        for path in paths {
            let path = normalize_path(path);
            if files.remove(&path).is_some() {
                removed.push(path);
            }
        }
        removed
    }

    /// Snapshot of the file map for the durable agent state.
    pub async fn snapshot(&self) -> HashMap<String, FileState> {
        self.files.lock().await.clone()
    }

    /// Restore the file map from a durable snapshot.
    pub async fn restore(&self, map: HashMap<String, FileState>) {
        let mut files = self.files.lock().await;
        *files = map
            .into_iter()
            .map(|(path, state)| (normalize_path(&path), state))
            .collect();
    }
}

fn is_code_source(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| CODE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}
