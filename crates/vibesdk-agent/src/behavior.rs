//! Build behaviors. The agent owns a behavior value; `build` dispatches
//! into the matching loop with a back-reference to the agent, which carries
//! the shared operation surface (state, workspace, websocket, inference).

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use vibesdk_core::types::BehaviorKind;

use crate::agent::CodeGenAgent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Behavior {
    Phasic,
    /// Declared but not yet driven by a planner loop; shares the phasic
    /// operation surface.
    Agentic { current_plan: Option<String> },
}

impl Default for Behavior {
    fn default() -> Self {
        Self::Phasic
    }
}

impl Behavior {
    pub fn from_kind(kind: BehaviorKind) -> Self {
        match kind {
            BehaviorKind::Phasic => Self::Phasic,
            BehaviorKind::Agentic => Self::Agentic { current_plan: None },
        }
    }

    pub fn kind(&self) -> BehaviorKind {
        match self {
            Self::Phasic => BehaviorKind::Phasic,
            Self::Agentic { .. } => BehaviorKind::Agentic,
        }
    }

    /// The build state machine for this behavior.
    pub async fn build(&self, agent: &Arc<CodeGenAgent>) -> Result<()> {
        match self {
            Self::Phasic => agent.phasic_build_loop().await,
            Self::Agentic { .. } => Err(anyhow!("agentic build loop is not implemented")),
        }
    }
}
