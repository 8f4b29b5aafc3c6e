use std::time::Duration;

use vibesdk_core::error::PathTraversal;
use vibesdk_core::sandbox::{ExecOptions, LocalSandbox, Sandbox};
use vibesdk_core::types::SandboxInstanceMetadata;

fn provision(dir: &tempfile::TempDir) -> LocalSandbox {
    LocalSandbox::provision(dir.path(), "test-instance", "127.0.0.1").expect("provision")
}

#[tokio::test]
async fn exec_captures_output_and_exit_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = provision(&dir);

    let ok = sandbox.exec("echo hello", ExecOptions::default()).await.expect("exec");
    assert!(ok.success());
    assert_eq!(ok.stdout.trim(), "hello");

    let fail = sandbox.exec("exit 3", ExecOptions::default()).await.expect("exec");
    assert!(!fail.success());
    assert_eq!(fail.exit_code, 3);
}

#[tokio::test]
async fn exec_honors_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = provision(&dir);

    let result = sandbox
        .exec(
            "sleep 5",
            ExecOptions {
                timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        )
        .await
        .expect("exec");
    assert_eq!(result.exit_code, 124);
    assert!(result.stderr.contains("timed out"));
}

#[tokio::test]
async fn file_io_round_trips_inside_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = provision(&dir);

    sandbox.write_file("src/App.tsx", b"content").await.expect("write");
    let read = sandbox.read_file("src/App.tsx").await.expect("read");
    assert_eq!(read, b"content");
}

#[tokio::test]
async fn traversal_paths_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = provision(&dir);

    let err = sandbox.write_file("../outside.txt", b"x").await.expect_err("must reject");
    assert!(err.downcast_ref::<PathTraversal>().is_some());

    let err = sandbox.read_file("a/../../etc/passwd").await.expect_err("must reject");
    assert!(err.downcast_ref::<PathTraversal>().is_some());
}

#[tokio::test]
async fn processes_are_tracked_and_killable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = provision(&dir);

    let id = sandbox
        .start_process("sleep 30", ExecOptions::default())
        .await
        .expect("start");
    let info = sandbox.get_process(&id).await.expect("tracked");
    assert!(info.running);
    assert_eq!(sandbox.list_processes().await.len(), 1);

    sandbox.kill_process(&id).await.expect("kill");
    assert!(sandbox.get_process(&id).await.is_none());
}

#[tokio::test]
async fn deploy_writes_files_and_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = provision(&dir);

    let meta = SandboxInstanceMetadata {
        template_name: "react".into(),
        project_name: "demo".into(),
        ..Default::default()
    };
    let files = vec![("index.html".to_string(), b"<html/>".to_vec())];
    sandbox.deploy(&files, &meta).await.expect("deploy");

    assert_eq!(sandbox.read_file("index.html").await.expect("read"), b"<html/>");
    let metadata = sandbox.read_file("metadata.json").await.expect("read");
    let parsed: SandboxInstanceMetadata = serde_json::from_slice(&metadata).expect("parse");
    assert_eq!(parsed.template_name, "react");
    assert_eq!(parsed.project_name, "demo");
}

#[tokio::test]
async fn exposed_ports_build_preview_urls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = provision(&dir);

    let url = sandbox.expose_port(4567).await.expect("expose");
    assert_eq!(url, "http://127.0.0.1:4567");
    assert_eq!(sandbox.get_exposed_ports().await, vec![4567]);

    sandbox.unexpose_port(4567).await;
    assert!(sandbox.get_exposed_ports().await.is_empty());
}
