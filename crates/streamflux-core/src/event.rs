//! Event Data Structures
//!
//! This module defines the core `StreamEvent` type - the unit of data pulled
//! from a queue partition and fanned out to subscribers.
//!
//! ## Structure
//! Each event carries:
//! - **stream**: the logical stream identity `(namespace, key)` it belongs to
//! - **sequence**: monotonically increasing offset within its queue partition
//! - **timestamp**: when the event was enqueued (milliseconds since epoch)
//! - **payload**: the actual data (arbitrary bytes)
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for zero-copy fan-out (one event delivered to N
//!   subscribers without cloning the payload)
//! - Sequence is u64, scoped to a single partition; there is no ordering
//!   across partitions
//! - Implements `Serialize`/`Deserialize` for checkpoint metadata and tooling

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a logical stream: the fan-out key events are matched against
/// when routed from a partition to subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    /// Namespace grouping related streams (e.g., a deployment or tenant)
    pub namespace: String,

    /// Key identifying the stream within the namespace
    pub key: String,
}

impl StreamId {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// A single event pulled from a queue partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Logical stream this event belongs to
    pub stream: StreamId,

    /// Offset of this event within its partition
    pub sequence: u64,

    /// Enqueue timestamp in milliseconds since epoch
    pub timestamp: i64,

    /// Payload
    pub payload: Bytes,
}

impl StreamEvent {
    pub fn new(stream: StreamId, sequence: u64, timestamp: i64, payload: Bytes) -> Self {
        Self {
            stream,
            sequence,
            timestamp,
            payload,
        }
    }

    /// Estimate the size of this event in bytes
    pub fn estimated_size(&self) -> usize {
        8 + // sequence
        8 + // timestamp
        self.stream.namespace.len() +
        self.stream.key.len() +
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_display() {
        let id = StreamId::new("prod", "orders-17");
        assert_eq!(id.to_string(), "prod/orders-17");
    }

    #[test]
    fn test_stream_id_equality() {
        let a = StreamId::new("ns", "k");
        let b = StreamId::new("ns", "k");
        let c = StreamId::new("ns", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_event_estimated_size() {
        let event = StreamEvent::new(
            StreamId::new("ns", "key"),
            0,
            1_700_000_000_000,
            Bytes::from_static(b"hello"),
        );
        assert_eq!(event.estimated_size(), 8 + 8 + 2 + 3 + 5);
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = StreamEvent::new(
            StreamId::new("ns", "key"),
            42,
            1_700_000_000_000,
            Bytes::from_static(b"payload"),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
