//! Error types for StreamFlux agents

use crate::subscriptions::SubscriptionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent {0} is faulted")]
    Faulted(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Subscription {0} is past its reactivation window")]
    GraceWindowExpired(SubscriptionId),

    #[error("Delivery failed for subscription {subscription}: {reason}")]
    Delivery {
        subscription: SubscriptionId,
        reason: String,
    },

    #[error("Queue error: {0}")]
    Core(#[from] streamflux_core::CoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] streamflux_checkpoint::CheckpointError),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
