//! Shared fixtures: a scripted inference client keyed by system-prompt
//! patterns, a minimal on-disk template, and a test config.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vibesdk_agent::agent::CodeGenAgent;
use vibesdk_agent::inference::{InferenceClient, InferenceRequest};
use vibesdk_agent::manager::AgentManager;
use vibesdk_core::config::Config;
use vibesdk_core::db::{AppService, Db};
use vibesdk_core::error::Cancelled;

/// Scripted client: the first system-message substring that matches picks
/// the response list; responses pop in order and the last one repeats.
pub struct ScriptedInference {
    scripts: Mutex<HashMap<&'static str, (Vec<String>, usize)>>,
    /// When set, calls whose system prompt contains this pattern block
    /// until the abort token fires.
    pub block_on: Option<&'static str>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            block_on: None,
        }
    }

    pub fn script(self, pattern: &'static str, responses: &[&str]) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern, (responses.iter().map(|s| s.to_string()).collect(), 0));
        self
    }

    pub fn blocking_on(mut self, pattern: &'static str) -> Self {
        self.block_on = Some(pattern);
        self
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn infer(&self, request: InferenceRequest, abort: &CancellationToken) -> Result<String> {
        let system = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if let Some(pattern) = self.block_on {
            if system.contains(pattern) {
                tokio::select! {
                    _ = abort.cancelled() => return Err(anyhow!(Cancelled)),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        return Err(anyhow!("blocked call was never cancelled"))
                    }
                }
            }
        }

        let response = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            let matched = scripts
                .iter_mut()
                .find(|(pattern, _)| system.contains(**pattern));
            match matched {
                Some((_, (responses, cursor))) => {
                    let response = responses
                        .get(*cursor)
                        .or_else(|| responses.last())
                        .cloned()
                        .unwrap_or_else(|| "{}".to_string());
                    *cursor += 1;
                    response
                }
                None => "{}".to_string(),
            }
        };

        if let Some(tx) = request.on_chunk {
            let _ = tx.send(response.clone());
        }
        Ok(response)
    }
}

pub const BLUEPRINT_JSON: &str = r#"{
  "title": "Todo List",
  "description": "A minimal todo list app",
  "projectName": "todo list",
  "frameworks": ["react"],
  "initialPhase": {
    "name": "Initial App",
    "description": "Scaffold the application shell",
    "lastPhase": false,
    "files": [{"path": "src/App.tsx", "purpose": "application entry"}]
  }
}"#;

pub const IMPL_JSON: &str = r#"{
  "files": [{
    "path": "src/App.tsx",
    "purpose": "application entry",
    "contents": "export default function App() { return null }\n"
  }],
  "commands": []
}"#;

pub const EMPTY_PHASE_JSON: &str =
    r#"{"name": "Done", "description": "nothing left", "lastPhase": false, "files": []}"#;

pub const EMPTY_IMPL_JSON: &str = r#"{"files": [], "commands": []}"#;

pub fn next_phase_json(index: usize) -> String {
    format!(
        r#"{{"name": "Phase {index}", "description": "more work", "lastPhase": false,
            "files": [{{"path": "src/phase{index}.ts", "purpose": "phase module"}}]}}"#
    )
}

pub fn impl_json_for(index: usize) -> String {
    format!(
        r#"{{"files": [{{"path": "src/phase{index}.ts", "purpose": "phase module",
            "contents": "export const phase = {index};\n"}}], "commands": []}}"#
    )
}

/// Write a minimal starter template under `{data_dir}/templates/react/`.
pub fn write_template(data_dir: &str) {
    let root = format!("{data_dir}/templates/react");
    std::fs::create_dir_all(format!("{root}/src")).expect("create template dir");
    std::fs::write(
        format!("{root}/template.json"),
        r#"{
          "description": "React starter",
          "frameworks": ["react"],
          "commands": {"bootstrap": "", "dev": "", "lint": "", "typecheck": ""},
          "dontTouchFiles": ["wrangler.jsonc"],
          "redactedFiles": [".env"]
        }"#,
    )
    .expect("write template.json");
    std::fs::write(
        format!("{root}/package.json"),
        "{\n  \"name\": \"template\",\n  \"dependencies\": {}\n}\n",
    )
    .expect("write package.json");
    std::fs::write(format!("{root}/src/index.css"), "body { margin: 0 }\n").expect("write css");
    std::fs::write(format!("{root}/.gitignore"), "node_modules\n").expect("write gitignore");
    std::fs::write(format!("{root}/wrangler.jsonc"), "{\n  \"name\": \"template\"\n}\n")
        .expect("write wrangler");
}

pub fn test_config(data_dir: &str, max_phases: u32) -> Arc<Config> {
    Arc::new(Config {
        host: "127.0.0.1".into(),
        port: 0,
        custom_domain: String::new(),
        node_env: "test".into(),
        data_dir: data_dir.to_string(),
        jwt_secret: "test-secret".into(),
        llm_base_url: String::new(),
        llm_api_key: String::new(),
        model: "test-model".into(),
        max_phases,
        fast_smart_fixes: false,
        sandbox_bootstrap_timeout_s: 30,
        rate_limit_requests: 100,
        rate_limit_period_s: 60,
        rate_limit_burst: 0,
        screenshot_api_url: String::new(),
        github_api_url: String::new(),
    })
}

pub fn app_service(data_dir: &str) -> AppService {
    let db = Arc::new(Db::open(&format!("{data_dir}/app.db")).expect("open app db"));
    db.migrate_app().expect("migrate app db");
    AppService::new(db)
}

pub fn manager(
    config: Arc<Config>,
    service: AppService,
    inference: Arc<dyn InferenceClient>,
) -> AgentManager {
    AgentManager::new(config, service, inference)
}

/// Poll the agent until `done` returns true or the deadline passes.
pub async fn wait_for<F>(agent: &Arc<CodeGenAgent>, mut done: F, what: &str)
where
    F: FnMut(&vibesdk_agent::agent::AgentState) -> bool,
{
    for _ in 0..200 {
        let state = agent.state_snapshot().await;
        if done(&state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}
