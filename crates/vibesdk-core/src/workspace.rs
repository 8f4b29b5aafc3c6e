//! Content-addressed workspace: a minimal git built on the agent's SQLite
//! tables. Raw objects (blob/tree/commit) live in `workspace_objects` keyed
//! by SHA-256 oid, refs in `workspace_refs`, and the staging index in
//! `workspace_index`. The index doubles as the working copy: staged state
//! IS the workdir state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::Db;
use crate::types::CommitInfo;

pub const DEFAULT_AUTHOR_NAME: &str = "Vibesdk";
pub const DEFAULT_AUTHOR_EMAIL: &str = "vibesdk-bot@vibesdk.dev";

const KIND_BLOB: &str = "blob";
const KIND_TREE: &str = "tree";
const KIND_COMMIT: &str = "commit";

const MODE_FILE: &str = "100644";
const MODE_DIR: &str = "40000";

/// How long `get_head` may block before the watchdog rejects.
const HEAD_TIMEOUT_SECS: u64 = 5;

pub type FilesChangedCallback = Box<dyn Fn(&[String]) + Send + Sync>;

/// One row of the status matrix: object ids for a tracked path as seen by
/// HEAD, the stage, and the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub path: String,
    pub head: Option<String>,
    pub stage: Option<String>,
    pub workdir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommitDetails {
    pub info: CommitInfo,
    pub file_count: usize,
    pub files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResetResult {
    pub oid: String,
    pub files_reset: usize,
}

/// An exported object or ref, ready for external replay.
#[derive(Debug, Clone)]
pub struct GitObjectExport {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CommitData {
    tree: String,
    parents: Vec<String>,
    author_name: String,
    author_email: String,
    timestamp_secs: i64,
    message: String,
}

pub struct Workspace {
    db: Arc<Db>,
    default_branch: String,
    on_files_changed: Mutex<Option<FilesChangedCallback>>,
}

// ── Object framing ────────────────────────────────────────────────────────

fn frame(kind: &str, data: &[u8]) -> Vec<u8> {
    let mut framed = format!("{kind} {}\0", data.len()).into_bytes();
    framed.extend_from_slice(data);
    framed
}

fn hash_object(kind: &str, data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(frame(kind, data));
    hex::encode(hasher.finalize())
}

fn unframe(bytes: &[u8]) -> Result<(String, Vec<u8>)> {
    let nul = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| anyhow!("malformed object: missing header terminator"))?;
    let header = std::str::from_utf8(&bytes[..nul]).context("malformed object header")?;
    let kind = header
        .split(' ')
        .next()
        .ok_or_else(|| anyhow!("malformed object header: {header}"))?;
    Ok((kind.to_string(), bytes[nul + 1..].to_vec()))
}

/// Leading slashes are stripped so "/src/App.tsx" and "src/App.tsx" address
/// the same entry.
pub fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

impl Workspace {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            default_branch: "main".to_string(),
            on_files_changed: Mutex::new(None),
        }
    }

    pub fn set_files_changed_callback(&self, cb: FilesChangedCallback) {
        let mut guard = self.on_files_changed.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(cb);
    }

    // ── init ─────────────────────────────────────────────────────────────

    /// Idempotent: creates HEAD pointing at refs/heads/<branch> unless a
    /// HEAD already exists.
    pub fn init(&mut self, default_branch: &str) -> Result<()> {
        let started = Instant::now();
        self.default_branch = default_branch.to_string();
        if self.db.get_ref("HEAD")?.is_none() {
            self.db
                .set_ref("HEAD", &format!("ref: refs/heads/{default_branch}"))?;
        }
        info!(
            branch = default_branch,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "workspace initialized"
        );
        Ok(())
    }

    fn current_branch_ref(&self) -> Result<String> {
        match self.db.get_ref("HEAD")? {
            Some(head) if head.starts_with("ref: ") => Ok(head["ref: ".len()..].to_string()),
            _ => Ok(format!("refs/heads/{}", self.default_branch)),
        }
    }

    /// Resolve a ref name (HEAD, refs/heads/x, branch short name, or a raw
    /// oid) to a commit oid.
    pub fn resolve_ref(&self, name: &str) -> Result<Option<String>> {
        if name == "HEAD" {
            let branch_ref = self.current_branch_ref()?;
            return self.db.get_ref(&branch_ref);
        }
        if let Some(oid) = self.db.get_ref(name)? {
            return Ok(Some(oid));
        }
        if let Some(oid) = self.db.get_ref(&format!("refs/heads/{name}"))? {
            return Ok(Some(oid));
        }
        if self.db.get_object(name)?.is_some() {
            return Ok(Some(name.to_string()));
        }
        Ok(None)
    }

    pub fn head_oid(&self) -> Result<Option<String>> {
        self.resolve_ref("HEAD")
    }

    /// HEAD oid behind a watchdog: a read that blocks beyond 5 s rejects
    /// with a timeout error, which callers treat as "no head".
    pub async fn get_head(self: &Arc<Self>) -> Result<Option<String>> {
        let ws = Arc::clone(self);
        let read = tokio::task::spawn_blocking(move || ws.head_oid());
        match tokio::time::timeout(std::time::Duration::from_secs(HEAD_TIMEOUT_SECS), read).await {
            Ok(joined) => joined.context("head read task failed")?,
            Err(_) => Err(anyhow!("timed out reading HEAD after {HEAD_TIMEOUT_SECS}s")),
        }
    }

    // ── stage ────────────────────────────────────────────────────────────

    /// Write blobs for each file and update the index entries.
    pub fn stage(&self, files: &[(String, String)]) -> Result<()> {
        for (path, contents) in files {
            let path = normalize_path(path);
            let data = contents.as_bytes();
            let oid = hash_object(KIND_BLOB, data);
            self.db.put_object(&oid, KIND_BLOB, data)?;
            self.db.set_index_entry(&path, &oid)?;
        }
        Ok(())
    }

    // ── status ───────────────────────────────────────────────────────────

    /// Per tracked path, the (head, stage, workdir) object ids. The staged
    /// copy is the working copy, so `workdir == stage` always.
    pub fn status_matrix(&self) -> Result<Vec<StatusRow>> {
        let head_files: BTreeMap<String, String> = match self.head_oid()? {
            Some(oid) => self.tree_entries_of_commit(&oid)?,
            None => BTreeMap::new(),
        };
        let mut paths: BTreeMap<String, (Option<String>, Option<String>)> = BTreeMap::new();
        for (path, oid) in &head_files {
            paths.entry(path.clone()).or_default().0 = Some(oid.clone());
        }
        for (path, oid) in self.db.list_index()? {
            paths.entry(path).or_default().1 = Some(oid);
        }
        Ok(paths
            .into_iter()
            .map(|(path, (head, stage))| StatusRow {
                path,
                head,
                workdir: stage.clone(),
                stage,
            })
            .collect())
    }

    // ── commit ───────────────────────────────────────────────────────────

    /// Stage `files`, then commit the index if it differs from HEAD.
    /// Returns `None` when nothing changed (commits are idempotent with
    /// respect to identical content).
    pub fn commit(&self, files: &[(String, String)], message: &str) -> Result<Option<CommitInfo>> {
        self.stage(files)?;

        let matrix = self.status_matrix()?;
        let dirty = matrix.iter().any(|row| row.head != row.stage);
        if !dirty {
            return Ok(None);
        }

        let index = self.db.list_index()?;
        let tree_oid = self.write_tree(&index)?;

        let parent = self.head_oid()?;
        let timestamp = chrono::Utc::now().timestamp();
        let mut text = format!("tree {tree_oid}\n");
        if let Some(ref parent_oid) = parent {
            text.push_str(&format!("parent {parent_oid}\n"));
        }
        text.push_str(&format!(
            "author {DEFAULT_AUTHOR_NAME} <{DEFAULT_AUTHOR_EMAIL}> {timestamp}\n\n{message}"
        ));

        let data = text.into_bytes();
        let oid = hash_object(KIND_COMMIT, &data);
        self.db.put_object(&oid, KIND_COMMIT, &data)?;

        let branch_ref = self.current_branch_ref()?;
        self.db.set_ref(&branch_ref, &oid)?;

        Ok(Some(CommitInfo {
            oid,
            message: message.to_string(),
            author: format!("{DEFAULT_AUTHOR_NAME} <{DEFAULT_AUTHOR_EMAIL}>"),
            timestamp: timestamp * 1000,
        }))
    }

    /// Build nested tree objects bottom-up from flat `(path, blob_oid)`
    /// entries; returns the root tree oid.
    fn write_tree(&self, entries: &[(String, String)]) -> Result<String> {
        #[derive(Default)]
        struct Dir {
            files: BTreeMap<String, String>,
            dirs: BTreeMap<String, Dir>,
        }

        fn insert(dir: &mut Dir, path: &str, oid: &str) {
            match path.split_once('/') {
                Some((head, rest)) => {
                    insert(dir.dirs.entry(head.to_string()).or_default(), rest, oid);
                }
                None => {
                    dir.files.insert(path.to_string(), oid.to_string());
                }
            }
        }

        fn write(ws: &Workspace, dir: &Dir) -> Result<String> {
            let mut rows: Vec<String> = Vec::new();
            for (name, sub) in &dir.dirs {
                let sub_oid = write(ws, sub)?;
                rows.push(format!("{MODE_DIR} {KIND_TREE} {sub_oid}\t{name}"));
            }
            for (name, oid) in &dir.files {
                rows.push(format!("{MODE_FILE} {KIND_BLOB} {oid}\t{name}"));
            }
            rows.sort();
            let data = rows.join("\n").into_bytes();
            let oid = hash_object(KIND_TREE, &data);
            ws.db.put_object(&oid, KIND_TREE, &data)?;
            Ok(oid)
        }

        let mut root = Dir::default();
        for (path, oid) in entries {
            insert(&mut root, path, oid);
        }
        write(self, &root)
    }

    // ── read side ────────────────────────────────────────────────────────

    fn read_commit(&self, oid: &str) -> Result<CommitData> {
        let (kind, data) = self
            .db
            .get_object(oid)?
            .ok_or_else(|| anyhow!("no such object: {oid}"))?;
        if kind != KIND_COMMIT {
            return Err(anyhow!("object {oid} is a {kind}, expected commit"));
        }
        let text = String::from_utf8(data).context("commit is not UTF-8")?;
        let (header, message) = text
            .split_once("\n\n")
            .ok_or_else(|| anyhow!("malformed commit {oid}"))?;

        let mut tree = String::new();
        let mut parents = Vec::new();
        let mut author_name = DEFAULT_AUTHOR_NAME.to_string();
        let mut author_email = DEFAULT_AUTHOR_EMAIL.to_string();
        let mut timestamp_secs = 0i64;
        for line in header.lines() {
            if let Some(rest) = line.strip_prefix("tree ") {
                tree = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("parent ") {
                parents.push(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("author ") {
                // "Name <email> secs"
                if let Some(lt) = rest.find('<') {
                    author_name = rest[..lt].trim().to_string();
                    if let Some(gt) = rest.find('>') {
                        author_email = rest[lt + 1..gt].to_string();
                        timestamp_secs = rest[gt + 1..].trim().parse().unwrap_or(0);
                    }
                }
            }
        }
        Ok(CommitData {
            tree,
            parents,
            author_name,
            author_email,
            timestamp_secs,
            message: message.to_string(),
        })
    }

    /// Flat `(path, blob_oid)` map of everything reachable from a commit's
    /// tree.
    fn tree_entries_of_commit(&self, commit_oid: &str) -> Result<BTreeMap<String, String>> {
        let commit = self.read_commit(commit_oid)?;
        let mut out = BTreeMap::new();
        self.walk_tree(&commit.tree, "", &mut out)?;
        Ok(out)
    }

    fn walk_tree(&self, tree_oid: &str, prefix: &str, out: &mut BTreeMap<String, String>) -> Result<()> {
        let (kind, data) = self
            .db
            .get_object(tree_oid)?
            .ok_or_else(|| anyhow!("no such tree: {tree_oid}"))?;
        if kind != KIND_TREE {
            return Err(anyhow!("object {tree_oid} is a {kind}, expected tree"));
        }
        let text = String::from_utf8(data).context("tree is not UTF-8")?;
        for row in text.lines().filter(|l| !l.is_empty()) {
            let (meta, name) = row
                .split_once('\t')
                .ok_or_else(|| anyhow!("malformed tree row: {row}"))?;
            let mut parts = meta.split(' ');
            let _mode = parts.next();
            let entry_kind = parts.next().unwrap_or_default();
            let oid = parts.next().unwrap_or_default();
            let full = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            };
            match entry_kind {
                KIND_TREE => self.walk_tree(oid, &full, out)?,
                KIND_BLOB => {
                    out.insert(full, oid.to_string());
                }
                other => return Err(anyhow!("unexpected tree entry kind: {other}")),
            }
        }
        Ok(())
    }

    // ── log / show ───────────────────────────────────────────────────────

    /// Walk commits from HEAD following first parents, newest first.
    /// Returns an empty list on any failure.
    pub fn log(&self, limit: usize) -> Vec<CommitInfo> {
        match self.log_inner(limit) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("workspace log failed: {e:#}");
                Vec::new()
            }
        }
    }

    fn log_inner(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        let mut entries = Vec::new();
        let mut cursor = self.head_oid()?;
        while let Some(oid) = cursor {
            if entries.len() >= limit {
                break;
            }
            let commit = self.read_commit(&oid)?;
            entries.push(CommitInfo {
                oid: oid.clone(),
                message: commit.message.clone(),
                author: format!("{} <{}>", commit.author_name, commit.author_email),
                timestamp: commit.timestamp_secs * 1000,
            });
            cursor = commit.parents.first().cloned();
        }
        Ok(entries)
    }

    pub fn show(&self, oid: &str) -> Result<CommitDetails> {
        let commit = self.read_commit(oid)?;
        let files: Vec<String> = {
            let mut out = BTreeMap::new();
            self.walk_tree(&commit.tree, "", &mut out)?;
            out.into_keys().collect()
        };
        Ok(CommitDetails {
            info: CommitInfo {
                oid: oid.to_string(),
                message: commit.message,
                author: format!("{} <{}>", commit.author_name, commit.author_email),
                timestamp: commit.timestamp_secs * 1000,
            },
            file_count: files.len(),
            files,
        })
    }

    // ── reset ────────────────────────────────────────────────────────────

    /// Point HEAD's branch at `refname`; with `hard` also rewrite the index
    /// to the target commit's tree and fire the files-changed callback.
    pub fn reset(&self, refname: &str, hard: bool) -> Result<ResetResult> {
        let oid = self
            .resolve_ref(refname)?
            .ok_or_else(|| anyhow!("cannot resolve ref: {refname}"))?;
        let branch_ref = self.current_branch_ref()?;
        self.db.set_ref(&branch_ref, &oid)?;

        let mut files_reset = 0;
        if hard {
            let entries = self.tree_entries_of_commit(&oid)?;
            self.db.clear_index()?;
            for (path, blob_oid) in &entries {
                self.db.set_index_entry(path, blob_oid)?;
            }
            files_reset = entries.len();
            let changed: Vec<String> = entries.into_keys().collect();
            let guard = self.on_files_changed.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = guard.as_ref() {
                cb(&changed);
            }
        }
        Ok(ResetResult { oid, files_reset })
    }

    // ── file readback ────────────────────────────────────────────────────

    /// Decode the files of a commit as UTF-8; blobs containing a null byte
    /// are treated as binary and skipped.
    pub fn read_files_from_commit(&self, oid: &str) -> Result<Vec<(String, String)>> {
        let entries = self.tree_entries_of_commit(oid)?;
        let mut files = Vec::new();
        for (path, blob_oid) in entries {
            let Some((_, data)) = self.db.get_object(&blob_oid)? else {
                continue;
            };
            if data.contains(&0) {
                continue;
            }
            match String::from_utf8(data) {
                Ok(contents) => files.push((path, contents)),
                Err(_) => continue,
            }
        }
        Ok(files)
    }

    // ── export / import ──────────────────────────────────────────────────

    /// Stream out every object (framed) and every ref for external replay.
    pub fn export_git_objects(&self) -> Result<Vec<GitObjectExport>> {
        let mut out = Vec::new();
        for (oid, kind, data) in self.db.list_objects()? {
            out.push(GitObjectExport {
                path: format!("objects/{oid}"),
                data: frame(&kind, &data),
            });
        }
        for (name, oid) in self.db.list_refs()? {
            out.push(GitObjectExport {
                path: name,
                data: oid.into_bytes(),
            });
        }
        Ok(out)
    }

    /// Rebuild a workspace from an `export_git_objects` dump.
    pub fn import_git_objects(&self, objects: &[GitObjectExport]) -> Result<()> {
        for obj in objects {
            if let Some(oid) = obj.path.strip_prefix("objects/") {
                let (kind, data) = unframe(&obj.data)?;
                self.db.put_object(oid, &kind, &data)?;
            } else {
                let value = String::from_utf8(obj.data.clone())
                    .with_context(|| format!("ref {} is not UTF-8", obj.path))?;
                self.db.set_ref(&obj.path, &value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_normalization_strips_leading_slash() {
        assert_eq!(normalize_path("/src/App.tsx"), "src/App.tsx");
        assert_eq!(normalize_path("src/App.tsx"), "src/App.tsx");
    }

    #[test]
    fn object_framing_round_trips() {
        let framed = frame("blob", b"hello");
        let (kind, data) = unframe(&framed).unwrap();
        assert_eq!(kind, "blob");
        assert_eq!(data, b"hello");
    }

    #[test]
    fn identical_content_hashes_identically() {
        assert_eq!(hash_object("blob", b"x"), hash_object("blob", b"x"));
        assert_ne!(hash_object("blob", b"x"), hash_object("tree", b"x"));
    }
}
