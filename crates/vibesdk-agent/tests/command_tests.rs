mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use vibesdk_core::types::BehaviorKind;

use vibesdk_agent::agent::{CodeGenAgent, InitArgs};

async fn initialized_agent(
    data_dir: &str,
    inference: Arc<ScriptedInference>,
) -> Arc<CodeGenAgent> {
    write_template(data_dir);
    let service = app_service(data_dir);
    let mgr = manager(test_config(data_dir, 12), service, inference);
    let agent = mgr.get_or_create("agent-cmd").await.expect("create agent");
    agent
        .initialize(InitArgs {
            query: "build a todo list".to_string(),
            user_id: "user-1".to_string(),
            host_name: "127.0.0.1".to_string(),
            template_name: Some("react".to_string()),
            behavior: BehaviorKind::Phasic,
        })
        .await
        .expect("initialize");

    // Wait for the background initial deploy to provision the sandbox.
    for _ in 0..100 {
        if let Some(deployment) = agent.deployment() {
            if deployment.sandbox().await.is_some() {
                return agent;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("sandbox was never provisioned");
}

#[tokio::test]
async fn failing_install_recovers_through_setup_assistant() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo\n"])
            // The assistant proposes a command that succeeds.
            .script("setup assistant", &[r#"["true install-known-pkg"]"#]),
    );
    let agent = initialized_agent(&data_dir, inference).await;

    // The original install fails on every attempt (no such executable).
    agent
        .execute_commands(&["definitely-missing-install-tool-xyz".to_string()], true)
        .await
        .expect("execute");

    let state = agent.state_snapshot().await;
    assert!(
        state.commands_history.contains(&"true install-known-pkg".to_string()),
        "history must contain the assistant's working command: {:?}",
        state.commands_history
    );
    assert!(
        !state
            .commands_history
            .iter()
            .any(|c| c.contains("definitely-missing-install-tool-xyz")),
        "failed command must not enter the history"
    );
}

#[tokio::test]
async fn successful_install_syncs_package_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo\n"]),
    );
    let agent = initialized_agent(&data_dir, inference).await;

    // An install-family command that succeeds and mutates package.json in
    // the sandbox, as a package manager would.
    let mutate = r#"echo '{"name":"mutated","dependencies":{"left-pad":"1"}}' > package.json # install"#;
    agent
        .execute_commands(&[mutate.to_string()], false)
        .await
        .expect("execute");

    let state = agent.state_snapshot().await;
    assert!(state.last_package_json.contains("left-pad"));
    let messages: Vec<String> = agent
        .file_manager()
        .workspace()
        .log(50)
        .into_iter()
        .map(|c| c.message)
        .collect();
    assert!(
        messages
            .iter()
            .any(|m| m == "chore: sync package.json dependencies from sandbox"),
        "manifest drift must be committed: {messages:?}"
    );
}

#[tokio::test]
async fn command_history_is_deduplicated_and_filtered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().to_string_lossy().to_string();

    let inference = Arc::new(
        ScriptedInference::new()
            .script("project blueprint", &[BLUEPRINT_JSON])
            .script("predict the shell commands", &["[]"])
            .script("README", &["# Todo\n"]),
    );
    let agent = initialized_agent(&data_dir, inference).await;

    agent
        .execute_commands(
            &[
                "echo one".to_string(),
                "echo one".to_string(),
                "echo two".to_string(),
            ],
            false,
        )
        .await
        .expect("execute");

    let state = agent.state_snapshot().await;
    let echoes: Vec<&String> = state
        .commands_history
        .iter()
        .filter(|c| c.starts_with("echo"))
        .collect();
    assert_eq!(echoes, vec!["echo one", "echo two"]);
    assert!(state.commands_history.iter().all(|c| !c.contains(" undefined")));
}
