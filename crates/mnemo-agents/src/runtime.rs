use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::info;

use mnemo_core::error::ConfigError;
use mnemo_core::types::IntentCategory;
use mnemo_llm::LlmClient;

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::variant::AgentVariant;

/// Agent id of the citation-validated Study specialization. Not routed
/// through the registry: the orchestrator swaps a knowledge turn onto it
/// when retrieval produced citable sources.
pub const STUDY_AGENT_ID: &str = "study";

/// The agent pool plus the intent routing table.
///
/// The registry maps every category to an agent id and is validated at
/// construction: a dangling agent id is a fatal configuration error.
pub struct AgentRuntime {
    agents: HashMap<String, Arc<Agent>>,
    registry: HashMap<IntentCategory, String>,
}

impl AgentRuntime {
    /// Build the default pool: one agent per variant over the shared client,
    /// and the standard category routing.
    pub fn with_defaults(
        client: Arc<dyn LlmClient>,
        model: &str,
    ) -> std::result::Result<Self, ConfigError> {
        let agents = vec![
            Agent::new("conversational", AgentVariant::Conversational, client.clone(), model),
            Agent::new("knowledge", AgentVariant::Knowledge, client.clone(), model),
            Agent::new("memory", AgentVariant::Memory, client.clone(), model),
            Agent::new("graph", AgentVariant::Graph, client.clone(), model),
            Agent::new(STUDY_AGENT_ID, AgentVariant::Study, client, model),
        ];

        use IntentCategory::*;
        let registry = [
            (Greeting, "conversational"),
            (Farewell, "conversational"),
            (Thanks, "conversational"),
            (Help, "conversational"),
            (Status, "conversational"),
            (KnowledgeQuery, "knowledge"),
            (MemoryStore, "memory"),
            (MemoryRetrieve, "memory"),
            (GraphQuery, "graph"),
            (Chitchat, "conversational"),
            (Unknown, "conversational"),
        ]
        .into_iter()
        .map(|(category, id)| (category, id.to_string()))
        .collect();

        Self::new(agents, registry)
    }

    /// Build a runtime from explicit parts, validating the registry.
    pub fn new(
        agents: Vec<Agent>,
        registry: HashMap<IntentCategory, String>,
    ) -> std::result::Result<Self, ConfigError> {
        let agents: HashMap<String, Arc<Agent>> = agents
            .into_iter()
            .map(|a| (a.id().to_string(), Arc::new(a)))
            .collect();

        for (category, agent_id) in &registry {
            if !agents.contains_key(agent_id) {
                return Err(ConfigError::new(format!(
                    "intent {category} routes to unknown agent {agent_id}"
                )));
            }
        }

        Ok(Self { agents, registry })
    }

    /// Resolve the agent for a category. `out_of_scope` never reaches an
    /// agent (the orchestrator short-circuits it); anything unrouted falls
    /// back to the conversational agent.
    pub fn select(&self, category: IntentCategory) -> Result<Arc<Agent>> {
        let id = self
            .registry
            .get(&category)
            .or_else(|| self.registry.get(&IntentCategory::Unknown))
            .ok_or_else(|| AgentError::UnknownAgent {
                id: category.to_string(),
            })?;
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent { id: id.clone() })
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.get(agent_id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start every agent in parallel. All failures are aggregated; a single
    /// bad agent never hides another's error.
    pub async fn start_all(&self) -> Result<()> {
        self.lifecycle(true).await
    }

    /// Stop every agent in parallel, aggregating failures the same way.
    pub async fn stop_all(&self) -> Result<()> {
        self.lifecycle(false).await
    }

    async fn lifecycle(&self, start: bool) -> Result<()> {
        let ops = self.agents.values().map(|agent| {
            let agent = agent.clone();
            async move {
                let result = if start { agent.start().await } else { agent.stop().await };
                (agent.id().to_string(), result)
            }
        });

        let failures: Vec<(String, String)> = join_all(ops)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e.to_string())))
            .collect();

        if failures.is_empty() {
            info!(count = self.agents.len(), start, "agent lifecycle complete");
            Ok(())
        } else {
            Err(AgentError::Lifecycle(failures))
        }
    }
}
