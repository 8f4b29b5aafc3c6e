//! Process-wide map of agent id → live agent. Each agent owns its own
//! SQLite database under `{data_dir}/agents/`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::info;

use vibesdk_core::{config::Config, db::AppService, db::Db};

use crate::agent::CodeGenAgent;
use crate::inference::InferenceClient;

pub struct AgentManager {
    config: Arc<Config>,
    app_service: AppService,
    inference_client: Arc<dyn InferenceClient>,
    agents: Mutex<HashMap<String, Arc<CodeGenAgent>>>,
}

impl AgentManager {
    pub fn new(
        config: Arc<Config>,
        app_service: AppService,
        inference_client: Arc<dyn InferenceClient>,
    ) -> Self {
        Self {
            config,
            app_service,
            inference_client,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<CodeGenAgent>> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    /// Look up a live agent, opening it from its database when absent
    /// (restart recovery or first request).
    pub async fn get_or_create(&self, agent_id: &str) -> Result<Arc<CodeGenAgent>> {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get(agent_id) {
            return Ok(Arc::clone(agent));
        }

        let agents_dir = format!("{}/agents", self.config.data_dir);
        std::fs::create_dir_all(&agents_dir)
            .with_context(|| format!("failed to create {agents_dir}"))?;
        let db = Arc::new(Db::open(&format!("{agents_dir}/{agent_id}.db"))?);
        let agent = CodeGenAgent::open(
            agent_id,
            Arc::clone(&self.config),
            db,
            self.app_service.clone(),
            Arc::clone(&self.inference_client),
        )?;
        info!(agent_id, "agent opened");
        agents.insert(agent_id.to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.lock().await.len()
    }
}
