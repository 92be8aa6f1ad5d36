//! Queue Adapter - Pull Source Seam
//!
//! The `QueueAdapter` trait is the boundary between the pull agents and the
//! underlying queue technology. An adapter serves a fixed set of partitions
//! and answers batched pulls at a cursor.
//!
//! ## Fencing
//!
//! Every pull presents a fencing token (the epoch assigned to the current
//! partition owner). The adapter remembers the newest token it has seen per
//! partition and rejects pulls presenting an older one. When ownership moves,
//! the new owner's first pull carries a bumped token, which fences the old
//! owner out on its next pull.
//!
//! ## Example
//!
//! ```ignore
//! let adapter = MemoryQueueAdapter::new(&[0, 1]);
//! adapter.append(0, StreamId::new("ns", "orders"), Bytes::from("e0")).await?;
//!
//! let batch = adapter.pull(0, 0, token, 32).await?;
//! for event in &batch.events {
//!     // deliver...
//! }
//! ```

use crate::error::{CoreError, Result};
use crate::event::{StreamEvent, StreamId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// A batch of events pulled from one partition.
#[derive(Debug, Clone)]
pub struct PulledBatch {
    /// Partition the batch was pulled from
    pub partition_id: u32,

    /// Events in partition order
    pub events: Vec<StreamEvent>,

    /// Cursor to present on the next pull (sequence after the last event,
    /// or the requested cursor when the batch is empty)
    pub next_cursor: u64,
}

/// Pull source for partitioned queues.
///
/// Implementations must be safe to share across agents (`Send + Sync`); each
/// partition is only ever pulled by its current owner, enforced through the
/// fencing token.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Partitions this adapter serves.
    async fn partition_ids(&self) -> Vec<u32>;

    /// Pull up to `max_events` events from `partition_id` starting at
    /// `cursor`, presenting the owner's `fencing_token`.
    ///
    /// Fails with [`CoreError::StaleFencingToken`] when a newer token has
    /// already been presented for the partition.
    async fn pull(
        &self,
        partition_id: u32,
        cursor: u64,
        fencing_token: u64,
        max_events: usize,
    ) -> Result<PulledBatch>;
}

#[derive(Debug, Default)]
struct PartitionQueue {
    events: Vec<StreamEvent>,
    /// Newest fencing token presented for this partition
    fence: u64,
    /// Transient failures to inject before the next successful pull
    fail_next: u32,
}

/// In-process queue adapter.
///
/// Backs integration tests and embedded deployments. Appends assign
/// contiguous sequences per partition; pulls enforce the fencing contract.
pub struct MemoryQueueAdapter {
    partitions: RwLock<HashMap<u32, PartitionQueue>>,
}

impl MemoryQueueAdapter {
    /// Create an adapter serving the given partitions.
    pub fn new(partition_ids: &[u32]) -> Self {
        let partitions = partition_ids
            .iter()
            .map(|id| (*id, PartitionQueue::default()))
            .collect();
        Self {
            partitions: RwLock::new(partitions),
        }
    }

    /// Append an event to a partition, returning its assigned sequence.
    pub async fn append(
        &self,
        partition_id: u32,
        stream: StreamId,
        payload: Bytes,
    ) -> Result<u64> {
        let mut partitions = self.partitions.write().await;
        let queue = partitions
            .get_mut(&partition_id)
            .ok_or(CoreError::PartitionNotFound(partition_id))?;

        let sequence = queue.events.len() as u64;
        queue
            .events
            .push(StreamEvent::new(stream, sequence, current_timestamp_ms(), payload));
        Ok(sequence)
    }

    /// Inject `count` transient pull failures on a partition.
    pub async fn fail_next_pulls(&self, partition_id: u32, count: u32) {
        let mut partitions = self.partitions.write().await;
        if let Some(queue) = partitions.get_mut(&partition_id) {
            queue.fail_next = count;
        }
    }

    /// Number of events enqueued on a partition.
    pub async fn partition_len(&self, partition_id: u32) -> usize {
        let partitions = self.partitions.read().await;
        partitions
            .get(&partition_id)
            .map(|q| q.events.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl QueueAdapter for MemoryQueueAdapter {
    async fn partition_ids(&self) -> Vec<u32> {
        let partitions = self.partitions.read().await;
        let mut ids: Vec<u32> = partitions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn pull(
        &self,
        partition_id: u32,
        cursor: u64,
        fencing_token: u64,
        max_events: usize,
    ) -> Result<PulledBatch> {
        let mut partitions = self.partitions.write().await;
        let queue = partitions
            .get_mut(&partition_id)
            .ok_or(CoreError::PartitionNotFound(partition_id))?;

        if queue.fail_next > 0 {
            queue.fail_next -= 1;
            return Err(CoreError::Queue(format!(
                "transient pull failure on partition {}",
                partition_id
            )));
        }

        if fencing_token < queue.fence {
            return Err(CoreError::StaleFencingToken {
                partition_id,
                presented: fencing_token,
                current: queue.fence,
            });
        }
        queue.fence = fencing_token;

        let start = (cursor as usize).min(queue.events.len());
        let end = (start + max_events).min(queue.events.len());
        let events: Vec<StreamEvent> = queue.events[start..end].to_vec();
        let next_cursor = cursor + events.len() as u64;

        debug!(
            partition_id = partition_id,
            cursor = cursor,
            pulled = events.len(),
            "Pulled batch"
        );

        Ok(PulledBatch {
            partition_id,
            events,
            next_cursor,
        })
    }
}

/// Get current timestamp in milliseconds since epoch
fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("System time before UNIX epoch")
        .as_millis() as i64
}
