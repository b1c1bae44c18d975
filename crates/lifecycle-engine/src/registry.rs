//! Agent registry
//!
//! The scheduler's bookkeeping of live and retiring agents, keyed by name.

use dashmap::DashMap;
use drover_core::{Agent, AgentSnapshot};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<DashMap<String, Arc<Agent>>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents_count", &self.agents.len())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its name. Returns the agent it replaced.
    pub fn register(&self, agent: Agent) -> (Arc<Agent>, Option<Arc<Agent>>) {
        let agent = Arc::new(agent);
        let previous = self.agents.insert(agent.name().to_string(), agent.clone());
        if previous.is_some() {
            warn!(agent = %agent.name(), "Replaced an agent registered under the same name");
        } else {
            info!(agent = %agent.name(), id = %agent.id(), "Agent registered");
        }
        (agent, previous)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.get(name).map(|entry| entry.value().clone())
    }

    /// Remove exactly this agent. A newer agent that reuses the name stays.
    pub fn remove(&self, agent: &Arc<Agent>) -> bool {
        let removed = self
            .agents
            .remove_if(agent.name(), |_, current| Arc::ptr_eq(current, agent))
            .is_some();
        if removed {
            info!(agent = %agent.name(), "Agent removed");
        }
        removed
    }

    /// Every registered agent, live or retiring
    pub fn list(&self) -> Vec<Arc<Agent>> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Agents whose deletion was requested but whose last teardown failed
    pub fn pending_deletions(&self) -> Vec<Arc<Agent>> {
        self.agents
            .iter()
            .filter(|entry| entry.value().needs_teardown_retry())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        let mut snapshots: Vec<_> = self.agents.iter().map(|entry| entry.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
