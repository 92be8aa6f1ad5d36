//! Stream Provider Manager - Control Plane
//!
//! Process-wide coordinator for one stream provider. Applies the balancer's
//! assignment by creating and destroying pulling agents, and broadcasts
//! typed control commands to every agent it hosts, returning one typed
//! result per agent in stable agent-id order.
//!
//! Commands are idempotent end to end: `StartAgents` on a running provider
//! and `StopAgents` on a stopped one change nothing and report the same
//! aggregate state.

use crate::agent::{AgentState, PullingAgent};
use crate::balancer::{AssignmentTable, QueueBalancer};
use crate::config::AgentOptions;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use streamflux_checkpoint::CheckpointStore;
use streamflux_core::QueueAdapter;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Control commands broadcast to every agent on the addressed provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    StartAgents,
    StopAgents,
    GetAgentsState,
    GetNumberRunningAgents,
}

/// Per-agent command outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Started,
    Stopped,
    State(AgentState),
    RunningPartitions(usize),
}

/// One agent's entry in a broadcast response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommandResult {
    pub agent_id: String,
    pub outcome: CommandOutcome,
}

/// Coarse provider-level aggregate of per-agent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    AgentsStarted,
    AgentsStopped,
}

struct ManagedAgent {
    agent: Arc<PullingAgent>,
    /// Partition set (with tokens) this agent was created for
    assigned: Vec<(u32, u64)>,
}

/// Control plane for one provider on this process.
pub struct StreamProviderManager {
    provider_name: String,
    adapter_name: String,
    options: AgentOptions,
    adapter: Arc<dyn QueueAdapter>,
    checkpoints: Arc<dyn CheckpointStore>,
    balancer: QueueBalancer,
    agents: RwLock<BTreeMap<String, ManagedAgent>>,
    /// Whether StartAgents is in effect; newly created agents follow it
    desired_running: RwLock<bool>,
}

impl StreamProviderManager {
    /// Create a manager over the adapter's partition space. No agents exist
    /// until the first membership change.
    pub async fn new(
        provider_name: impl Into<String>,
        adapter_name: impl Into<String>,
        adapter: Arc<dyn QueueAdapter>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: AgentOptions,
    ) -> Self {
        let partition_ids = adapter.partition_ids().await;
        Self {
            provider_name: provider_name.into(),
            adapter_name: adapter_name.into(),
            options,
            adapter,
            checkpoints,
            balancer: QueueBalancer::new(partition_ids),
            agents: RwLock::new(BTreeMap::new()),
            desired_running: RwLock::new(false),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Whether a command addressed to `(provider_name, adapter_name)` is for
    /// this manager.
    pub fn matches(&self, provider_name: &str, adapter_name: &str) -> bool {
        self.provider_name == provider_name && self.adapter_name == adapter_name
    }

    /// React to a new live member set: rebalance and apply the resulting
    /// assignment, creating agents for new owners and destroying agents
    /// whose partitions moved away.
    pub async fn on_membership_change(&self, live_members: &[String]) -> Result<()> {
        let table = self.balancer.on_membership_change(live_members).await;
        self.apply_assignment(&table).await
    }

    async fn apply_assignment(&self, table: &AssignmentTable) -> Result<()> {
        let desired_running = *self.desired_running.read().await;
        let mut agents = self.agents.write().await;

        // Destroy agents whose assignment disappeared or changed.
        let stale: Vec<String> = agents
            .iter()
            .filter(|(agent_id, managed)| {
                let desired = table.partitions_of(agent_id);
                desired.is_empty() || desired != managed.assigned
            })
            .map(|(agent_id, _)| agent_id.clone())
            .collect();

        for agent_id in stale {
            if let Some(managed) = agents.remove(&agent_id) {
                if let Err(e) = managed.agent.stop().await {
                    warn!(
                        agent_id = %agent_id,
                        error = %e,
                        "Failed to stop agent during reassignment"
                    );
                }
                info!(agent_id = %agent_id, "Agent destroyed on reassignment");
            }
        }

        // Create agents for owners that have none yet.
        for agent_id in table.agent_ids() {
            let assigned = table.partitions_of(&agent_id);
            if assigned.is_empty() || agents.contains_key(&agent_id) {
                continue;
            }

            let agent = Arc::new(PullingAgent::new(
                agent_id.clone(),
                assigned.clone(),
                Arc::clone(&self.adapter),
                Arc::clone(&self.checkpoints),
                self.options.clone(),
            ));

            if desired_running {
                agent.start().await?;
            }

            info!(
                agent_id = %agent_id,
                partitions = assigned.len(),
                running = desired_running,
                "Agent created"
            );
            agents.insert(agent_id, ManagedAgent { agent, assigned });
        }

        Ok(())
    }

    /// Broadcast a control command to every agent, returning one result per
    /// agent in stable agent-id order.
    pub async fn execute(&self, command: ControlCommand) -> Result<Vec<AgentCommandResult>> {
        match command {
            ControlCommand::StartAgents => *self.desired_running.write().await = true,
            ControlCommand::StopAgents => *self.desired_running.write().await = false,
            _ => {}
        }

        let agents = self.agents.read().await;
        let mut results = Vec::with_capacity(agents.len());

        for (agent_id, managed) in agents.iter() {
            let outcome = match command {
                ControlCommand::StartAgents => {
                    managed.agent.start().await?;
                    CommandOutcome::Started
                }
                ControlCommand::StopAgents => {
                    managed.agent.stop().await?;
                    CommandOutcome::Stopped
                }
                ControlCommand::GetAgentsState => {
                    CommandOutcome::State(managed.agent.state().await)
                }
                ControlCommand::GetNumberRunningAgents => {
                    CommandOutcome::RunningPartitions(managed.agent.running_partition_count().await)
                }
            };

            results.push(AgentCommandResult {
                agent_id: agent_id.clone(),
                outcome,
            });
        }

        info!(
            provider = %self.provider_name,
            adapter = %self.adapter_name,
            command = ?command,
            agents = results.len(),
            "Control command executed"
        );
        Ok(results)
    }

    /// Clean aggregate of per-agent states: `AgentsStarted` when every agent
    /// is `Started`, `AgentsStopped` when every agent is `Stopped`, `None`
    /// while any agent is transitioning or faulted (or no agents exist).
    pub async fn run_state(&self) -> Option<RunState> {
        let agents = self.agents.read().await;
        if agents.is_empty() {
            return None;
        }

        let mut states = Vec::with_capacity(agents.len());
        for managed in agents.values() {
            states.push(managed.agent.state().await);
        }

        if states.iter().all(|s| *s == AgentState::Started) {
            Some(RunState::AgentsStarted)
        } else if states.iter().all(|s| *s == AgentState::Stopped) {
            Some(RunState::AgentsStopped)
        } else {
            None
        }
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// The agent hosted under `agent_id`, if any.
    pub async fn agent(&self, agent_id: &str) -> Option<Arc<PullingAgent>> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|m| Arc::clone(&m.agent))
    }

    /// The agent currently owning `partition_id`, per the latest assignment.
    pub async fn agent_for_partition(&self, partition_id: u32) -> Option<Arc<PullingAgent>> {
        let owner = {
            let table = self.balancer.table().await;
            table.owner_of(partition_id)?.to_string()
        };
        self.agent(&owner).await
    }
}
