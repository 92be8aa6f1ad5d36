//! In-Memory Checkpoint Store
//!
//! Keeps checkpoints in a process-local map. Used by tests and by embedded
//! deployments that accept losing pull progress on restart.

use crate::error::Result;
use crate::types::Checkpoint;
use crate::CheckpointStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Process-local checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<(String, u32), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn read(&self, namespace: &str, partition_id: u32) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(&(namespace.to_string(), partition_id))
            .cloned())
    }

    async fn write(
        &self,
        namespace: &str,
        partition_id: u32,
        cursor: u64,
        timestamp: i64,
    ) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        let key = (namespace.to_string(), partition_id);

        // Never regress delivered progress.
        if let Some(existing) = checkpoints.get(&key) {
            if cursor < existing.cursor {
                debug!(
                    namespace = %namespace,
                    partition_id = partition_id,
                    stored = existing.cursor,
                    offered = cursor,
                    "Ignoring checkpoint write below stored cursor"
                );
                return Ok(());
            }
        }

        checkpoints.insert(
            key,
            Checkpoint {
                namespace: namespace.to_string(),
                partition_id,
                cursor,
                updated_at: timestamp,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let store = MemoryCheckpointStore::new();
        assert!(store.read("ns", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryCheckpointStore::new();
        store.write("ns", 2, 17, 1_000).await.unwrap();

        let cp = store.read("ns", 2).await.unwrap().unwrap();
        assert_eq!(cp.namespace, "ns");
        assert_eq!(cp.partition_id, 2);
        assert_eq!(cp.cursor, 17);
        assert_eq!(cp.updated_at, 1_000);
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let store = MemoryCheckpointStore::new();
        store.write("ns", 0, 50, 1_000).await.unwrap();
        store.write("ns", 0, 20, 2_000).await.unwrap();

        let cp = store.read("ns", 0).await.unwrap().unwrap();
        assert_eq!(cp.cursor, 50, "lower cursor write must be ignored");
        assert_eq!(cp.updated_at, 1_000);
    }

    #[tokio::test]
    async fn test_equal_cursor_refreshes_timestamp() {
        let store = MemoryCheckpointStore::new();
        store.write("ns", 0, 50, 1_000).await.unwrap();
        store.write("ns", 0, 50, 2_000).await.unwrap();

        let cp = store.read("ns", 0).await.unwrap().unwrap();
        assert_eq!(cp.cursor, 50);
        assert_eq!(cp.updated_at, 2_000);
    }

    #[tokio::test]
    async fn test_namespaces_isolated() {
        let store = MemoryCheckpointStore::new();
        store.write("a", 0, 10, 1_000).await.unwrap();
        store.write("b", 0, 99, 1_000).await.unwrap();

        assert_eq!(store.read("a", 0).await.unwrap().unwrap().cursor, 10);
        assert_eq!(store.read("b", 0).await.unwrap().unwrap().cursor, 99);
    }
}
