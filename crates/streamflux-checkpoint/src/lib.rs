//! Checkpoint Store - Durable Pull Progress
//!
//! A checkpoint records how far a pulling agent has delivered a queue
//! partition: the cursor of the next undelivered event, keyed by
//! `(namespace, partition_id)`. On crash recovery an agent reads its
//! checkpoints and resumes pulling from there, which bounds redelivery to
//! the events pulled since the last persisted cursor (at-least-once).
//!
//! ## Implementations
//!
//! - [`MemoryCheckpointStore`]: in-process map, used in tests and embedded
//!   single-process deployments
//! - [`SqliteCheckpointStore`]: sqlx/SQLite-backed durable store
//!
//! ## Monotonicity
//!
//! Stores never regress a cursor: a write carrying a cursor lower than the
//! stored one is ignored. Agents only submit cursors for fully delivered
//! batches, so the stored cursor always points at delivered progress.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{CheckpointError, Result};
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
pub use types::Checkpoint;

use async_trait::async_trait;

/// Durable map from `(namespace, partition_id)` to the last delivered cursor.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a partition, if one has been written.
    async fn read(&self, namespace: &str, partition_id: u32) -> Result<Option<Checkpoint>>;

    /// Persist `cursor` for a partition. Writes carrying a cursor lower than
    /// the stored one are ignored.
    async fn write(
        &self,
        namespace: &str,
        partition_id: u32,
        cursor: u64,
        timestamp: i64,
    ) -> Result<()>;
}
