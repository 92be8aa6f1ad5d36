//! Checkpoint Type Definitions

use serde::{Deserialize, Serialize};

/// A persisted pull-progress marker for one queue partition.
///
/// `cursor` is the next undelivered sequence ("next offset" semantics): if
/// events 0-99 have been fully delivered, the checkpoint cursor is 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Namespace isolating checkpoint data per logical deployment
    pub namespace: String,

    /// Partition ID
    pub partition_id: u32,

    /// Next undelivered sequence
    pub cursor: u64,

    /// Write timestamp (milliseconds since Unix epoch)
    pub updated_at: i64,
}
