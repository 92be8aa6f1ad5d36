//! Agent configuration.
//!
//! `AgentOptions` carries the tuning knobs shared by every pulling agent a
//! provider hosts: checkpoint persistence, pull batching, retry policy, and
//! the buffering bounds for transiently inactive subscriptions.

use std::time::Duration;

/// Default interval between async checkpoint writes (1s)
pub const DEFAULT_CHECKPOINT_PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of events requested per pull
pub const DEFAULT_PULL_BATCH_SIZE: usize = 32;

/// Default bound on pull attempts before the agent faults
pub const DEFAULT_MAX_PULL_ATTEMPTS: u32 = 5;

/// Default grace window during which an inactive subscription may resubscribe
pub const DEFAULT_INACTIVE_GRACE: Duration = Duration::from_secs(30);

/// Default bound on events buffered for an inactive subscription
pub const DEFAULT_INACTIVE_BUFFER_LIMIT: usize = 256;

/// Agent configuration.
///
/// # Fields
///
/// * `checkpoint_namespace` - Isolates checkpoint data per logical deployment
/// * `checkpoint_persist_interval` - Wall-clock interval between async cursor writes
/// * `pull_batch_size` - Events requested per pull
/// * `max_pull_attempts` - Pull attempts before the agent transitions to Faulted
/// * `initial_backoff` / `max_backoff` - Exponential backoff bounds for pull retries
/// * `idle_pull_delay` - Sleep between pull rounds when all partitions are drained
/// * `inactive_grace` - How long a deactivated subscription may linger before removal
/// * `inactive_buffer_limit` - Events buffered per inactive subscription; reaching it
///   suspends pulls for the affected partition
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Checkpoint namespace (e.g., a deployment id)
    pub checkpoint_namespace: String,

    /// Interval between async checkpoint writes (default: 1s)
    pub checkpoint_persist_interval: Duration,

    /// Events requested per pull (default: 32)
    pub pull_batch_size: usize,

    /// Pull attempts before faulting (default: 5)
    pub max_pull_attempts: u32,

    /// First retry backoff (default: 100ms)
    pub initial_backoff: Duration,

    /// Backoff ceiling (default: 5s)
    pub max_backoff: Duration,

    /// Sleep between pull rounds when no events arrived (default: 20ms)
    pub idle_pull_delay: Duration,

    /// Reactivation window for inactive subscriptions (default: 30s)
    pub inactive_grace: Duration,

    /// Buffered-event bound per inactive subscription (default: 256)
    pub inactive_buffer_limit: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            checkpoint_namespace: "default".to_string(),
            checkpoint_persist_interval: DEFAULT_CHECKPOINT_PERSIST_INTERVAL,
            pull_batch_size: DEFAULT_PULL_BATCH_SIZE,
            max_pull_attempts: DEFAULT_MAX_PULL_ATTEMPTS,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            idle_pull_delay: Duration::from_millis(20),
            inactive_grace: DEFAULT_INACTIVE_GRACE,
            inactive_buffer_limit: DEFAULT_INACTIVE_BUFFER_LIMIT,
        }
    }
}

impl AgentOptions {
    /// Options with a specific checkpoint namespace and defaults elsewhere.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            checkpoint_namespace: namespace.into(),
            ..Self::default()
        }
    }
}
