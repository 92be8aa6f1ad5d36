//! Error types for the StreamFlux core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Stale fencing token for partition {partition_id}: presented {presented}, current {current}")]
    StaleFencingToken {
        partition_id: u32,
        presented: u64,
        current: u64,
    },

    #[error("Partition not found: {0}")]
    PartitionNotFound(u32),

    #[error("Queue error: {0}")]
    Queue(String),
}
