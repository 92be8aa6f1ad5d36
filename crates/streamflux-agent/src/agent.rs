//! Pulling Agent - Core Lifecycle and Pull Loop
//!
//! A `PullingAgent` owns a set of queue partitions and runs their
//! pull → deliver → checkpoint cycle. It manages:
//! - Lifecycle: `Stopped → Starting → Started → Stopping → Stopped`, with
//!   `Faulted` reached when pull retries are exhausted
//! - Cursor recovery from the checkpoint store on start
//! - Fan-out of pulled events through its `SubscriptionRegistry`
//! - Periodic async checkpoint writes of fully delivered cursors
//!
//! ## Lifecycle
//!
//! 1. **Build**: `PullingAgent::new` with the partitions (and fencing
//!    tokens) assigned by the balancer
//! 2. **Start**: seed cursors from checkpoints, spawn the pull loop;
//!    the first successful pull moves `Starting → Started`
//! 3. **Run**: pull batches, deliver to every matching subscription,
//!    persist cursors on an interval
//! 4. **Stop**: cooperative cancellation — no new pulls, in-flight
//!    delivery drains, a final checkpoint records delivered progress
//!
//! ## Delivery and checkpoints
//!
//! The in-memory cursor only advances after a batch is fully fanned out,
//! and checkpoint writes only carry that cursor, so a persisted checkpoint
//! never runs ahead of delivery. Writes are fire-and-forget: a failure is
//! logged and the cursor is retried on the next interval without blocking
//! the pull path.
//!
//! ## Example
//!
//! ```ignore
//! let agent = PullingAgent::new(
//!     "silo-a",
//!     table.partitions_of("silo-a"),
//!     adapter,
//!     checkpoints,
//!     AgentOptions::with_namespace("deploy-1"),
//! );
//!
//! agent.start().await?;
//! let sub = agent.registry().subscribe(stream, consumer).await;
//! // ... events flow ...
//! agent.stop().await?;
//! ```

use crate::config::AgentOptions;
use crate::error::Result;
use crate::subscriptions::SubscriptionRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use streamflux_checkpoint::CheckpointStore;
use streamflux_core::{CoreError, QueueAdapter, StreamId};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a pulling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Faulted,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Stopped => "Stopped",
            AgentState::Starting => "Starting",
            AgentState::Started => "Started",
            AgentState::Stopping => "Stopping",
            AgentState::Faulted => "Faulted",
        };
        f.write_str(s)
    }
}

/// Per-partition pull progress.
#[derive(Debug, Clone)]
struct PartitionSlot {
    partition_id: u32,

    /// Fencing token assigned by the balancer for this ownership
    fencing_token: u64,

    /// Next sequence to pull; equal to delivered progress because the
    /// cursor only advances after a batch is fully fanned out
    cursor: u64,

    /// Highest cursor known persisted
    last_persisted: u64,

    /// Streams observed on this partition (admission-control scope)
    streams_seen: HashSet<StreamId>,
}

/// Worker owning a set of partitions and their pull/deliver/checkpoint cycle.
pub struct PullingAgent {
    agent_id: String,
    options: AgentOptions,
    adapter: Arc<dyn QueueAdapter>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<RwLock<AgentState>>,
    slots: Arc<RwLock<Vec<PartitionSlot>>>,
    shutdown: RwLock<Option<watch::Sender<bool>>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl PullingAgent {
    /// Create an agent owning `partitions`, each paired with the fencing
    /// token the balancer assigned for it.
    pub fn new(
        agent_id: impl Into<String>,
        partitions: Vec<(u32, u64)>,
        adapter: Arc<dyn QueueAdapter>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: AgentOptions,
    ) -> Self {
        let slots = partitions
            .into_iter()
            .map(|(partition_id, fencing_token)| PartitionSlot {
                partition_id,
                fencing_token,
                cursor: 0,
                last_persisted: 0,
                streams_seen: HashSet::new(),
            })
            .collect();

        let registry = Arc::new(SubscriptionRegistry::from_options(&options));

        Self {
            agent_id: agent_id.into(),
            options,
            adapter,
            checkpoints,
            registry,
            state: Arc::new(RwLock::new(AgentState::Stopped)),
            slots: Arc::new(RwLock::new(slots)),
            shutdown: RwLock::new(None),
            task: RwLock::new(None),
        }
    }

    /// Begin the pull cycle. Idempotent: a no-op when already
    /// `Starting`/`Started` (or while a stop is draining).
    ///
    /// Cursors are seeded from the checkpoint store, so a restarted agent
    /// resumes at the earliest undelivered event rather than stream start.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                AgentState::Starting | AgentState::Started => {
                    debug!(agent_id = %self.agent_id, "Agent already started, skipping");
                    return Ok(());
                }
                AgentState::Stopping => {
                    warn!(agent_id = %self.agent_id, "Agent is stopping, skipping start");
                    return Ok(());
                }
                AgentState::Stopped | AgentState::Faulted => {}
            }
            *state = AgentState::Starting;
        }

        if let Err(e) = self.recover_cursors().await {
            *self.state.write().await = AgentState::Stopped;
            return Err(e);
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown.write().await = Some(tx);

        let task = PullTask {
            agent_id: self.agent_id.clone(),
            options: self.options.clone(),
            adapter: Arc::clone(&self.adapter),
            checkpoints: Arc::clone(&self.checkpoints),
            registry: Arc::clone(&self.registry),
            state: Arc::clone(&self.state),
            slots: Arc::clone(&self.slots),
            shutdown: rx,
        };

        let handle = tokio::spawn(async move {
            task.run().await;
        });
        *self.task.write().await = Some(handle);

        info!(
            agent_id = %self.agent_id,
            namespace = %self.options.checkpoint_namespace,
            "Pulling agent starting"
        );
        Ok(())
    }

    /// Stop the pull cycle. Idempotent: a no-op when already
    /// `Stopped`/`Stopping`.
    ///
    /// Cancels further pulls, waits for the in-flight delivery to finish,
    /// writes a final checkpoint for the highest fully delivered cursor per
    /// partition, then transitions to `Stopped`. Partition assignments are
    /// kept, so a later `start()` resumes the same partitions.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                AgentState::Stopped | AgentState::Stopping => {
                    debug!(agent_id = %self.agent_id, "Agent already stopped, skipping");
                    return Ok(());
                }
                _ => {}
            }
            *state = AgentState::Stopping;
        }

        if let Some(tx) = self.shutdown.write().await.take() {
            let _ = tx.send(true);
        }

        if let Some(handle) = self.task.write().await.take() {
            handle.await?;
        }

        // Final checkpoint: the loop has drained, so every cursor reflects
        // fully delivered state.
        let now = current_timestamp_ms();
        {
            let mut slots = self.slots.write().await;
            for slot in slots.iter_mut() {
                match self
                    .checkpoints
                    .write(
                        &self.options.checkpoint_namespace,
                        slot.partition_id,
                        slot.cursor,
                        now,
                    )
                    .await
                {
                    Ok(()) => slot.last_persisted = slot.cursor,
                    Err(e) => warn!(
                        agent_id = %self.agent_id,
                        partition_id = slot.partition_id,
                        error = %e,
                        "Final checkpoint write failed"
                    ),
                }
            }
        }

        *self.state.write().await = AgentState::Stopped;
        info!(agent_id = %self.agent_id, "Pulling agent stopped");
        Ok(())
    }

    /// Seed per-partition cursors from persisted checkpoints.
    async fn recover_cursors(&self) -> Result<()> {
        let mut slots = self.slots.write().await;
        for slot in slots.iter_mut() {
            let checkpoint = self
                .checkpoints
                .read(&self.options.checkpoint_namespace, slot.partition_id)
                .await?;

            let cursor = checkpoint.map(|c| c.cursor).unwrap_or(0);
            slot.cursor = cursor;
            slot.last_persisted = cursor;

            debug!(
                agent_id = %self.agent_id,
                partition_id = slot.partition_id,
                cursor = cursor,
                "Recovered cursor"
            );
        }
        Ok(())
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The registry consumers subscribe through. Scoped to this agent's
    /// partitions; never shared across agents.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Number of partitions this agent is actively pulling: the owned
    /// partition count when `Started`, otherwise 0.
    pub async fn running_partition_count(&self) -> usize {
        if *self.state.read().await == AgentState::Started {
            self.slots.read().await.len()
        } else {
            0
        }
    }

    /// Partitions currently owned, sorted.
    pub async fn partitions_owned(&self) -> Vec<u32> {
        let slots = self.slots.read().await;
        let mut ids: Vec<u32> = slots.iter().map(|s| s.partition_id).collect();
        ids.sort_unstable();
        ids
    }

    /// Fully delivered cursor for a partition, if owned.
    pub async fn delivered_cursor(&self, partition_id: u32) -> Option<u64> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .find(|s| s.partition_id == partition_id)
            .map(|s| s.cursor)
    }
}

enum PartitionOutcome {
    /// Events delivered this round (possibly 0)
    Pulled(usize),
    /// Backlogged subscription; partition skipped this round
    Suspended,
    /// Fenced out; partition dropped from the owned set
    Relinquished,
    /// Retries exhausted
    Faulted,
}

/// The spawned pull → deliver → checkpoint loop.
struct PullTask {
    agent_id: String,
    options: AgentOptions,
    adapter: Arc<dyn QueueAdapter>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<RwLock<AgentState>>,
    slots: Arc<RwLock<Vec<PartitionSlot>>>,
    shutdown: watch::Receiver<bool>,
}

impl PullTask {
    async fn run(mut self) {
        info!(agent_id = %self.agent_id, "Pull loop started");

        // An agent with nothing to pull is trivially started.
        if self.slots.read().await.is_empty() {
            let mut state = self.state.write().await;
            if *state == AgentState::Starting {
                *state = AgentState::Started;
            }
        }

        let mut last_persist = Instant::now();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if last_persist.elapsed() >= self.options.checkpoint_persist_interval {
                self.spawn_checkpoint_writes().await;
                last_persist = Instant::now();
            }

            match self.pull_round().await {
                Ok(true) => {}
                Ok(false) => {
                    let idle = self.options.idle_pull_delay;
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
                Err(()) => {
                    *self.state.write().await = AgentState::Faulted;
                    error!(
                        agent_id = %self.agent_id,
                        "Pulling agent faulted after exhausting pull retries"
                    );
                    break;
                }
            }
        }

        info!(agent_id = %self.agent_id, "Pull loop stopped");
    }

    /// One pass over the owned partitions. `Ok(true)` when any events
    /// arrived, `Err(())` on an unrecoverable fault.
    async fn pull_round(&mut self) -> std::result::Result<bool, ()> {
        let partition_ids: Vec<u32> = {
            let slots = self.slots.read().await;
            slots.iter().map(|s| s.partition_id).collect()
        };

        let mut any_events = false;
        for partition_id in partition_ids {
            if *self.shutdown.borrow() {
                break;
            }

            match self.pull_partition(partition_id).await {
                PartitionOutcome::Pulled(count) => {
                    if count > 0 {
                        any_events = true;
                    }
                }
                PartitionOutcome::Suspended => {}
                PartitionOutcome::Relinquished => {
                    let mut slots = self.slots.write().await;
                    slots.retain(|s| s.partition_id != partition_id);
                }
                PartitionOutcome::Faulted => return Err(()),
            }
        }

        Ok(any_events)
    }

    async fn pull_partition(&mut self, partition_id: u32) -> PartitionOutcome {
        let (cursor, fencing_token, streams) = {
            let slots = self.slots.read().await;
            match slots.iter().find(|s| s.partition_id == partition_id) {
                Some(slot) => (slot.cursor, slot.fencing_token, slot.streams_seen.clone()),
                None => return PartitionOutcome::Pulled(0),
            }
        };

        // Admission control: a backlogged subscription on any stream this
        // partition feeds suspends further pulls until it drains.
        for stream in &streams {
            if self.registry.is_backlogged(stream).await {
                debug!(
                    agent_id = %self.agent_id,
                    partition_id = partition_id,
                    stream = %stream,
                    "Backlogged subscription, suspending pulls"
                );
                return PartitionOutcome::Suspended;
            }
        }

        let mut attempts = 0u32;
        let mut backoff = self.options.initial_backoff;
        let batch = loop {
            match self
                .adapter
                .pull(
                    partition_id,
                    cursor,
                    fencing_token,
                    self.options.pull_batch_size,
                )
                .await
            {
                Ok(batch) => break batch,
                Err(CoreError::StaleFencingToken {
                    presented, current, ..
                }) => {
                    warn!(
                        agent_id = %self.agent_id,
                        partition_id = partition_id,
                        presented = presented,
                        current = current,
                        "Fenced out of partition, relinquishing ownership"
                    );
                    return PartitionOutcome::Relinquished;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.options.max_pull_attempts {
                        error!(
                            agent_id = %self.agent_id,
                            partition_id = partition_id,
                            error = %e,
                            attempts = attempts,
                            "Pull retries exhausted"
                        );
                        return PartitionOutcome::Faulted;
                    }

                    warn!(
                        agent_id = %self.agent_id,
                        partition_id = partition_id,
                        error = %e,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "Pull failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.changed() => return PartitionOutcome::Pulled(0),
                    }
                    backoff = (backoff * 2).min(self.options.max_backoff);
                }
            }
        };

        // First successful pull completes startup.
        {
            let mut state = self.state.write().await;
            if *state == AgentState::Starting {
                *state = AgentState::Started;
                info!(agent_id = %self.agent_id, "Pulling agent started");
            }
        }

        if batch.events.is_empty() {
            return PartitionOutcome::Pulled(0);
        }

        let mut new_streams: HashSet<StreamId> = HashSet::new();
        for event in &batch.events {
            new_streams.insert(event.stream.clone());
            self.registry.deliver(event).await;
        }
        let count = batch.events.len();

        // The batch is fully fanned out; only now does the cursor advance.
        {
            let mut slots = self.slots.write().await;
            if let Some(slot) = slots.iter_mut().find(|s| s.partition_id == partition_id) {
                slot.cursor = batch.next_cursor;
                slot.streams_seen.extend(new_streams);
            }
        }

        debug!(
            agent_id = %self.agent_id,
            partition_id = partition_id,
            delivered = count,
            next_cursor = batch.next_cursor,
            "Batch delivered"
        );
        PartitionOutcome::Pulled(count)
    }

    /// Fire-and-forget checkpoint writes for cursors that advanced since
    /// the last persist. A failed write leaves `last_persisted` untouched,
    /// so the cursor is retried on the next interval.
    async fn spawn_checkpoint_writes(&self) {
        let dirty: Vec<(u32, u64)> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter(|s| s.cursor > s.last_persisted)
                .map(|s| (s.partition_id, s.cursor))
                .collect()
        };

        for (partition_id, cursor) in dirty {
            let checkpoints = Arc::clone(&self.checkpoints);
            let slots = Arc::clone(&self.slots);
            let namespace = self.options.checkpoint_namespace.clone();
            let agent_id = self.agent_id.clone();

            tokio::spawn(async move {
                match checkpoints
                    .write(&namespace, partition_id, cursor, current_timestamp_ms())
                    .await
                {
                    Ok(()) => {
                        let mut slots = slots.write().await;
                        if let Some(slot) =
                            slots.iter_mut().find(|s| s.partition_id == partition_id)
                        {
                            slot.last_persisted = slot.last_persisted.max(cursor);
                        }
                    }
                    Err(e) => warn!(
                        agent_id = %agent_id,
                        partition_id = partition_id,
                        error = %e,
                        "Checkpoint write failed, will retry next interval"
                    ),
                }
            });
        }
    }
}

/// Get current timestamp in milliseconds since epoch
fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("System time before UNIX epoch")
        .as_millis() as i64
}
