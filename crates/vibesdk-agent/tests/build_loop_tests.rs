mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::*;
use vibesdk_core::types::{BehaviorKind, DevState};

use vibesdk_agent::agent::InitArgs;

fn init_args(query: &str) -> InitArgs {
    InitArgs {
        query: query.to_string(),
        user_id: "user-1".to_string(),
        host_name: "127.0.0.1".to_string(),
        template_name: Some("react".to_string()),
        behavior: BehaviorKind::Phasic,
    }
}

#[tokio::test]
async fn happy_path_builds_mvp_and_goes_idle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();
    write_template(&data_dir);

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("plan the next bounded implementation phase", &[EMPTY_PHASE_JSON])
            .script("implement one phase", &[IMPL_JSON, EMPTY_IMPL_JSON])
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo List\n\n[cloudflarebutton]\n"]),
    );
    let service = app_service(&data_dir);
    let mgr = manager(test_config(&data_dir, 12), service.clone(), inference);

    let agent = mgr.get_or_create("agent-1").await.expect("create agent");
    let blueprint = agent.initialize(init_args("build a todo list")).await.expect("initialize");
    assert_eq!(blueprint.title, "Todo List");

    agent.generate_all_files().await;
    wait_for(&agent, |s| s.mvp_generated && s.dev_state == DevState::Idle, "build to finish").await;

    let state = agent.state_snapshot().await;
    assert!(state.reviewing_initiated);
    assert!(state.project_name.starts_with("todo-list-"));
    // Initial phase implemented exactly once, flagged complete.
    assert_eq!(state.generated_phases.len(), 1);
    assert!(state.generated_phases[0].completed);
    assert_eq!(state.generated_phases[0].concept.name, "Initial App");

    // The phase's file is reachable from HEAD with identical bytes.
    let workspace = agent.file_manager().workspace();
    let head = workspace.head_oid().expect("head").expect("commits exist");
    let files = workspace.read_files_from_commit(&head).expect("read head");
    let app = files
        .iter()
        .find(|(path, _)| path == "src/App.tsx")
        .expect("App.tsx reachable from HEAD");
    assert_eq!(app.1, "export default function App() { return null }\n");

    let messages: Vec<String> = workspace.log(50).into_iter().map(|c| c.message).collect();
    assert!(messages.iter().any(|m| m == "Initial commit"));
    assert!(messages.iter().any(|m| m == "chore: Initialize project configuration files"));
    assert!(messages.iter().any(|m| m.starts_with("feat: Initial App")));

    // App record was persisted through the facade.
    let app_row = service.get_app("agent-1").expect("query").expect("app exists");
    assert_eq!(app_row.title, "Todo List");
}

#[tokio::test]
async fn phases_budget_bounds_the_build() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();
    write_template(&data_dir);

    // Phase generation never volunteers an empty phase; only the budget can
    // stop the loop.
    let phase_scripts: Vec<String> = (1..=10).map(next_phase_json).collect();
    let impl_scripts: Vec<String> =
        std::iter::once(IMPL_JSON.to_string()).chain((1..=10).map(impl_json_for)).collect();
    let phase_refs: Vec<&str> = phase_scripts.iter().map(String::as_str).collect();
    let impl_refs: Vec<&str> = impl_scripts.iter().map(String::as_str).collect();

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("plan the next bounded implementation phase", &phase_refs)
            .script("implement one phase", &impl_refs)
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo\n"]),
    );
    let service = app_service(&data_dir);
    let mgr = manager(test_config(&data_dir, 3), service, inference);

    let agent = mgr.get_or_create("agent-budget").await.expect("create agent");
    agent.initialize(init_args("build something big")).await.expect("initialize");

    agent.generate_all_files().await;
    wait_for(&agent, |s| s.mvp_generated && s.dev_state == DevState::Idle, "build to finish").await;

    let state = agent.state_snapshot().await;
    let completed = state.generated_phases.iter().filter(|p| p.completed).count();
    assert_eq!(completed, 3, "budget of 3 must cap implemented phases");
    assert!(state.phases_counter <= 0);
}

#[tokio::test]
async fn cancellation_mid_phase_goes_idle_with_generation_complete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();
    write_template(&data_dir);

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo\n"])
            .blocking_on("implement one phase"),
    );
    let service = app_service(&data_dir);
    let mgr = manager(test_config(&data_dir, 12), service, inference);

    let agent = mgr.get_or_create("agent-cancel").await.expect("create agent");
    agent.initialize(init_args("build a todo list")).await.expect("initialize");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    agent.hub().register("observer", tx);

    agent.generate_all_files().await;
    // Let the build reach the blocked implementation call, then cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    agent.cancel_current_inference();

    wait_for(&agent, |s| s.dev_state == DevState::Idle, "cancel to settle").await;

    let mut saw_complete = false;
    while let Ok(message) = rx.try_recv() {
        if message.contains("GENERATION_COMPLETE") {
            saw_complete = true;
        }
    }
    assert!(saw_complete, "GENERATION_COMPLETE must be broadcast after cancel");

    let state = agent.state_snapshot().await;
    assert!(!state.mvp_generated, "cancelled build must not mark the MVP done");
}

#[tokio::test]
async fn queued_user_request_recharges_phase_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();
    write_template(&data_dir);

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo\n"])
            .blocking_on("implement one phase"),
    );
    let service = app_service(&data_dir);
    let mut config = (*test_config(&data_dir, 12)).clone();
    config.max_phases = 1;
    let mgr = manager(Arc::new(config), service, inference);

    let agent = mgr.get_or_create("agent-recharge").await.expect("create agent");
    agent.initialize(init_args("build a todo list")).await.expect("initialize");

    // Budget exhausted to 1; a user request lifts it back to 3.
    agent.queue_user_request("make the header blue", Vec::new()).await;
    let state = agent.state_snapshot().await;
    assert_eq!(state.phases_counter, 3);
    assert_eq!(state.pending_user_inputs, vec!["make the header blue".to_string()]);
}

#[tokio::test]
async fn generate_all_files_is_a_noop_after_mvp_without_inputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();
    write_template(&data_dir);

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("plan the next bounded implementation phase", &[EMPTY_PHASE_JSON])
            .script("implement one phase", &[IMPL_JSON, EMPTY_IMPL_JSON])
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo\n"]),
    );
    let service = app_service(&data_dir);
    let mgr = manager(test_config(&data_dir, 12), service, inference);

    let agent = mgr.get_or_create("agent-noop").await.expect("create agent");
    agent.initialize(init_args("build a todo list")).await.expect("initialize");
    agent.generate_all_files().await;
    wait_for(&agent, |s| s.mvp_generated && s.dev_state == DevState::Idle, "first build").await;

    // Let the background init work (README commit) land before snapshotting.
    for _ in 0..100 {
        if agent.file_manager().get_file("README.md").await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let commits_before = agent.file_manager().workspace().log(100).len();
    agent.generate_all_files().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = agent.state_snapshot().await;
    assert_eq!(state.dev_state, DevState::Idle);
    assert_eq!(agent.file_manager().workspace().log(100).len(), commits_before);
}
