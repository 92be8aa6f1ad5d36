//! Queue Balancer - Partition-to-Agent Assignment
//!
//! Computes which agent owns which queue partition from the live member set
//! and recomputes on every membership change. Assignment is sticky: a
//! partition whose owner is still live keeps it, and only orphaned
//! partitions move (to the least-loaded live agent, ties broken by agent
//! id). Every reassignment bumps the partition's fencing token, which the
//! queue adapter checks on pull, so a stale owner is fenced out on its next
//! pull rather than racing the new one.
//!
//! The balancer is the single writer of the assignment table; agents read
//! snapshots to confirm continued ownership.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One partition's assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentEntry {
    /// Owning agent
    pub agent_id: String,

    /// Fencing token presented on every pull; bumped on each reassignment
    pub fencing_token: u64,
}

/// Versioned partition → agent table.
#[derive(Debug, Clone, Default)]
pub struct AssignmentTable {
    version: u64,
    entries: HashMap<u32, AssignmentEntry>,
}

impl AssignmentTable {
    /// Table version; increments on every rebalance.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn owner_of(&self, partition_id: u32) -> Option<&str> {
        self.entries.get(&partition_id).map(|e| e.agent_id.as_str())
    }

    pub fn token_for(&self, partition_id: u32) -> Option<u64> {
        self.entries.get(&partition_id).map(|e| e.fencing_token)
    }

    /// Partitions owned by `agent_id`, sorted, paired with their tokens.
    pub fn partitions_of(&self, agent_id: &str) -> Vec<(u32, u64)> {
        let mut partitions: Vec<(u32, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.agent_id == agent_id)
            .map(|(p, e)| (*p, e.fencing_token))
            .collect();
        partitions.sort_unstable();
        partitions
    }

    /// Agents present in the table, sorted.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.values().map(|e| e.agent_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Computes partition-to-agent assignment from the live member set.
pub struct QueueBalancer {
    partition_ids: Vec<u32>,
    table: RwLock<AssignmentTable>,
}

impl QueueBalancer {
    /// Balancer over a fixed partition space.
    pub fn new(mut partition_ids: Vec<u32>) -> Self {
        partition_ids.sort_unstable();
        partition_ids.dedup();
        Self {
            partition_ids,
            table: RwLock::new(AssignmentTable::default()),
        }
    }

    /// Recompute the assignment for a new live member set and publish it.
    /// Returns a snapshot of the new table.
    pub async fn on_membership_change(&self, live_agents: &[String]) -> AssignmentTable {
        let mut table = self.table.write().await;
        let next = Self::rebalance(&table, live_agents, &self.partition_ids);

        info!(
            version = next.version(),
            agents = live_agents.len(),
            partitions = next.len(),
            "Assignment recomputed"
        );

        *table = next.clone();
        next
    }

    /// Snapshot of the current table. Agents keep operating on the last
    /// published snapshot when the balancer is unreachable; fencing tokens
    /// make a stale snapshot safe.
    pub async fn table(&self) -> AssignmentTable {
        self.table.read().await.clone()
    }

    /// Sticky rebalance: keep partitions whose owner is still live, move
    /// orphans to the least-loaded live agent (ties by agent id), bumping
    /// the fencing token of every moved partition.
    fn rebalance(
        prev: &AssignmentTable,
        live_agents: &[String],
        partition_ids: &[u32],
    ) -> AssignmentTable {
        let mut agents: Vec<String> = live_agents.to_vec();
        agents.sort();
        agents.dedup();

        let mut next = AssignmentTable {
            version: prev.version + 1,
            entries: HashMap::new(),
        };

        if agents.is_empty() {
            return next;
        }

        let mut load_counts: HashMap<String, usize> =
            agents.iter().map(|a| (a.clone(), 0)).collect();

        // Phase 1: keep assignments whose owner is still live.
        let mut orphans = Vec::new();
        for partition_id in partition_ids {
            match prev.entries.get(partition_id) {
                Some(entry) if load_counts.contains_key(&entry.agent_id) => {
                    if let Some(count) = load_counts.get_mut(&entry.agent_id) {
                        *count += 1;
                    }
                    next.entries.insert(*partition_id, entry.clone());
                }
                _ => orphans.push(*partition_id),
            }
        }

        // Phase 2: orphans go to the least-loaded agent, token bumped.
        for partition_id in orphans {
            let best_agent = load_counts
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
                .map(|(agent, _)| agent.clone())
                .unwrap_or_else(|| agents[0].clone());

            if let Some(count) = load_counts.get_mut(&best_agent) {
                *count += 1;
            }

            let fencing_token = prev
                .entries
                .get(&partition_id)
                .map(|e| e.fencing_token + 1)
                .unwrap_or(1);

            debug!(
                partition_id = partition_id,
                agent_id = %best_agent,
                fencing_token = fencing_token,
                "Partition assigned"
            );

            next.entries.insert(
                partition_id,
                AssignmentEntry {
                    agent_id: best_agent,
                    fencing_token,
                },
            );
        }

        next
    }
}
