//! GitHub export against an in-process mock of the REST git-objects API.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use vibesdk_agent::github::{ExportProgressHook, GithubExportRequest, GithubExporter};
use vibesdk_core::db::Db;
use vibesdk_core::workspace::Workspace;

#[derive(Default)]
struct Recorded {
    blobs: Vec<String>,
    trees: Vec<Value>,
    commits: Vec<Value>,
    ref_updates: Vec<Value>,
}

#[derive(Clone)]
struct MockGithub {
    recorded: Arc<Mutex<Recorded>>,
}

impl MockGithub {
    fn new() -> Self {
        Self { recorded: Arc::default() }
    }

    fn take(&self) -> Recorded {
        std::mem::take(&mut self.recorded.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

async fn create_blob(State(state): State<MockGithub>, Json(body): Json<Value>) -> Json<Value> {
    let mut recorded = state.recorded.lock().unwrap_or_else(|e| e.into_inner());
    let content = body.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
    recorded.blobs.push(content);
    let sha = format!("blob-{}", recorded.blobs.len());
    Json(json!({ "sha": sha }))
}

async fn create_tree(State(state): State<MockGithub>, Json(body): Json<Value>) -> Json<Value> {
    let mut recorded = state.recorded.lock().unwrap_or_else(|e| e.into_inner());
    recorded.trees.push(body);
    let sha = format!("tree-{}", recorded.trees.len());
    Json(json!({ "sha": sha }))
}

async fn create_commit(State(state): State<MockGithub>, Json(body): Json<Value>) -> Json<Value> {
    let mut recorded = state.recorded.lock().unwrap_or_else(|e| e.into_inner());
    recorded.commits.push(body);
    let sha = format!("commit-{}", recorded.commits.len());
    Json(json!({ "sha": sha }))
}

async fn update_ref(State(state): State<MockGithub>, Json(body): Json<Value>) -> Json<Value> {
    let mut recorded = state.recorded.lock().unwrap_or_else(|e| e.into_inner());
    recorded.ref_updates.push(body);
    Json(json!({ "ref": "refs/heads/main" }))
}

async fn list_commits() -> Json<Value> {
    Json(json!([]))
}

async fn spawn_mock() -> (MockGithub, String) {
    let state = MockGithub::new();
    let app = Router::new()
        .route("/repos/:owner/:repo/git/blobs", post(create_blob))
        .route("/repos/:owner/:repo/git/trees", post(create_tree))
        .route("/repos/:owner/:repo/git/commits", post(create_commit))
        .route("/repos/:owner/:repo/git/refs/heads/:branch", patch(update_ref))
        .route("/repos/:owner/:repo/git/refs", post(update_ref))
        .route("/repos/:owner/:repo/commits", get(list_commits))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (state, format!("http://{addr}"))
}

fn workspace_with_history(files_per_commit: &[&[(&str, &str)]]) -> Arc<Workspace> {
    let db = Arc::new(Db::open(":memory:").expect("open db"));
    db.migrate_agent().expect("migrate");
    let mut ws = Workspace::new(db);
    ws.init("main").expect("init");
    let ws = Arc::new(ws);
    for (index, files) in files_per_commit.iter().enumerate() {
        let batch: Vec<(String, String)> = files
            .iter()
            .map(|(path, contents)| (path.to_string(), contents.to_string()))
            .collect();
        ws.commit(&batch, &format!("commit {}", index + 1))
            .expect("commit")
            .expect("created");
    }
    ws
}

fn request() -> GithubExportRequest {
    GithubExportRequest {
        repo_url: "https://github.com/acme/todo".to_string(),
        token: "ghp_test".to_string(),
        default_branch: "main".to_string(),
        author_name: "Vibesdk".to_string(),
        author_email: "vibesdk-bot@vibesdk.dev".to_string(),
    }
}

fn noop_progress() -> ExportProgressHook {
    Arc::new(|_, _| {})
}

#[tokio::test]
async fn export_dedups_blobs_by_content_hash() {
    let (mock, url) = spawn_mock().await;
    // Three commits all carrying the same unchanged shared file.
    let ws = workspace_with_history(&[
        &[("shared.txt", "same"), ("one.txt", "1")],
        &[("shared.txt", "same"), ("two.txt", "2")],
        &[("shared.txt", "same"), ("three.txt", "3")],
    ]);
    let objects = ws.export_git_objects().expect("export objects");

    let exporter = GithubExporter::new(&url);
    let result = exporter
        .export(&objects, &request(), &noop_progress())
        .await
        .expect("export");

    assert_eq!(result.commits_pushed, 3);
    // Distinct contents: "same", "1", "2", "3".
    assert_eq!(result.blobs_created, 4, "shared blob must upload exactly once");
    assert_eq!(result.last_oid, "commit-3");

    let recorded = mock.take();
    assert_eq!(recorded.blobs.len(), 4);
    assert_eq!(recorded.commits.len(), 3);
    // Commit chain: first has no parent, later ones chain on the previous.
    assert_eq!(recorded.commits[0]["parents"], json!([]));
    assert_eq!(recorded.commits[1]["parents"], json!(["commit-1"]));
    assert_eq!(recorded.commits[2]["parents"], json!(["commit-2"]));
    // Force-update of the branch ref to the last pushed commit.
    assert_eq!(recorded.ref_updates.len(), 1);
    assert_eq!(recorded.ref_updates[0]["sha"], "commit-3");
    assert_eq!(recorded.ref_updates[0]["force"], true);
}

#[tokio::test]
async fn export_substitutes_cloudflare_button_in_readme() {
    let (mock, url) = spawn_mock().await;
    let ws = workspace_with_history(&[&[
        ("README.md", "# App\n\n[cloudflarebutton]\n"),
        ("src/main.ts", "export {}\n"),
    ]]);
    let objects = ws.export_git_objects().expect("export objects");

    let exporter = GithubExporter::new(&url);
    let result = exporter
        .export(&objects, &request(), &noop_progress())
        .await
        .expect("export");

    // Original commit plus the synthetic README commit.
    assert_eq!(result.commits_pushed, 2);

    let recorded = mock.take();
    let last_message = recorded.commits.last().expect("commits")["message"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    assert_eq!(last_message, "docs: Add Cloudflare deploy button to README");
    // The placeholder no longer appears in any uploaded blob.
    for blob in &recorded.blobs {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .unwrap_or_default();
        let text = String::from_utf8_lossy(&decoded);
        assert!(!text.contains("[cloudflarebutton]"));
    }
}

#[tokio::test]
async fn tree_entries_use_blob_mode() {
    let (mock, url) = spawn_mock().await;
    let ws = workspace_with_history(&[&[("a.txt", "a")]]);
    let objects = ws.export_git_objects().expect("export objects");

    GithubExporter::new(&url)
        .export(&objects, &request(), &noop_progress())
        .await
        .expect("export");

    let recorded = mock.take();
    let entry = &recorded.trees[0]["tree"][0];
    assert_eq!(entry["mode"], "100644");
    assert_eq!(entry["type"], "blob");
    assert_eq!(entry["path"], "a.txt");
}
