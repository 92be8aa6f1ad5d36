//! StreamFlux Agent - Pull-Based Ingestion and Fan-Out
//!
//! This crate implements the pulling-agent subsystem: worker agents that
//! continuously pull event batches from partitioned queues and deliver them
//! to every active subscription on the matching streams, persisting cursor
//! checkpoints for crash recovery.
//!
//! ## Components
//!
//! - **PullingAgent**: owns a partition set and runs its pull → deliver →
//!   checkpoint cycle with a five-state lifecycle
//! - **QueueBalancer**: computes sticky partition-to-agent assignment with
//!   fencing tokens on every reassignment
//! - **SubscriptionRegistry**: per-agent fan-out of events to any number of
//!   independent subscriptions per stream
//! - **StreamProviderManager**: typed control plane broadcasting
//!   start/stop/query commands to every agent on the provider
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamflux_agent::{AgentOptions, ControlCommand, StreamProviderManager};
//! use streamflux_checkpoint::MemoryCheckpointStore;
//! use streamflux_core::MemoryQueueAdapter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = Arc::new(MemoryQueueAdapter::new(&[0, 1, 2, 3]));
//! let checkpoints = Arc::new(MemoryCheckpointStore::new());
//!
//! let manager = StreamProviderManager::new(
//!     "orders-provider",
//!     "memory",
//!     adapter,
//!     checkpoints,
//!     AgentOptions::with_namespace("prod"),
//! )
//! .await;
//!
//! // Membership arrives from the cluster; agents are created per member.
//! manager.on_membership_change(&["silo-a".to_string()]).await?;
//! manager.execute(ControlCommand::StartAgents).await?;
//!
//! // ... events flow to subscribers ...
//!
//! manager.execute(ControlCommand::StopAgents).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod balancer;
pub mod config;
pub mod error;
pub mod manager;
pub mod subscriptions;

pub use agent::{AgentState, PullingAgent};
pub use balancer::{AssignmentEntry, AssignmentTable, QueueBalancer};
pub use config::AgentOptions;
pub use error::{AgentError, Result};
pub use manager::{
    AgentCommandResult, CommandOutcome, ControlCommand, RunState, StreamProviderManager,
};
pub use subscriptions::{Subscriber, SubscriberError, SubscriptionId, SubscriptionRegistry};
