//! SQLite Checkpoint Store Implementation
//!
//! Durable checkpoint persistence over an embedded SQLite database. One row
//! per `(namespace, partition_id)`; the upsert keeps the cursor monotone at
//! the database level, so concurrent writers cannot regress progress.
//!
//! ## Usage
//!
//! ```ignore
//! use streamflux_checkpoint::{CheckpointStore, SqliteCheckpointStore};
//!
//! // Creates checkpoints.db (or opens if it exists)
//! let store = SqliteCheckpointStore::new("checkpoints.db").await?;
//! store.write("prod", 0, 1234, now_ms).await?;
//! ```
//!
//! ## Thread Safety
//!
//! Backed by an sqlx connection pool; safe to share via `Arc` across agent
//! tasks.

use crate::error::Result;
use crate::types::Checkpoint;
use crate::CheckpointStore;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    namespace    TEXT    NOT NULL,
    partition_id INTEGER NOT NULL,
    cursor       INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    PRIMARY KEY (namespace, partition_id)
)
"#;

/// SQLite-backed checkpoint store.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (or create) a checkpoint database at `path`.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub async fn new_in_memory() -> Result<Self> {
        // A single connection: every pooled connection to sqlite::memory:
        // would otherwise see its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn read(&self, namespace: &str, partition_id: u32) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT cursor, updated_at FROM checkpoints WHERE namespace = ? AND partition_id = ?",
        )
        .bind(namespace)
        .bind(partition_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Checkpoint {
            namespace: namespace.to_string(),
            partition_id,
            cursor: r.get::<i64, _>("cursor") as u64,
            updated_at: r.get::<i64, _>("updated_at"),
        }))
    }

    async fn write(
        &self,
        namespace: &str,
        partition_id: u32,
        cursor: u64,
        timestamp: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (namespace, partition_id, cursor, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (namespace, partition_id) DO UPDATE SET
                cursor = excluded.cursor,
                updated_at = excluded.updated_at
            WHERE excluded.cursor >= checkpoints.cursor
            "#,
        )
        .bind(namespace)
        .bind(partition_id as i64)
        .bind(cursor as i64)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
