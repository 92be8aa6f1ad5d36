//! Subscription Registry - Per-Stream Fan-Out
//!
//! The registry holds every subscription an agent is delivering to, keyed by
//! subscription id and matched by stream identity. Any number of
//! subscriptions may target the same stream; each receives the full event
//! sequence independently, and removing one never affects the others.
//!
//! ## Consumer disappearance
//!
//! A consumer that transiently disappears is `deactivate`d rather than
//! removed: the subscription buffers subsequent events up to a bound, and a
//! `resubscribe` within the grace window flushes the buffer in original
//! order before any newer event. Past the window the subscription is gone
//! and a fresh `subscribe` starts a new logical subscription.
//!
//! ## Fault isolation
//!
//! A subscriber whose `deliver` fails is notified via `on_error` and its
//! subscription removed; delivery to every other subscription on the stream
//! continues untouched.

use crate::config::AgentOptions;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use streamflux_core::{StreamEvent, StreamId};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error a subscriber may return from `deliver`.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Capability interface implemented by delivery targets.
///
/// The registry holds this interface, never a concrete consumer type.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver one event. An error removes the subscription after `on_error`.
    async fn deliver(&self, event: StreamEvent) -> std::result::Result<(), SubscriberError>;

    /// Called once when a delivery failure removes the subscription.
    async fn on_error(&self, error: &SubscriberError) {
        let _ = error;
    }

    /// Called when the owning consumer deactivates.
    async fn on_deactivate(&self) {}
}

/// Identity of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

enum SubscriptionState {
    Active,
    Inactive {
        since: Instant,
        buffer: VecDeque<StreamEvent>,
    },
}

struct Subscription {
    stream: StreamId,
    subscriber: Arc<dyn Subscriber>,
    state: SubscriptionState,
    /// Suppress events below this sequence (checkpoint-based resumption)
    resume_from: Option<u64>,
}

/// Per-agent collection of subscriptions with fan-out delivery.
pub struct SubscriptionRegistry {
    inactive_grace: Duration,
    inactive_buffer_limit: usize,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new(inactive_grace: Duration, inactive_buffer_limit: usize) -> Self {
        Self {
            inactive_grace,
            inactive_buffer_limit,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_options(options: &AgentOptions) -> Self {
        Self::new(options.inactive_grace, options.inactive_buffer_limit)
    }

    /// Add an Active subscription on `stream`. Delivery starts with the next
    /// event the owning agent pulls.
    pub async fn subscribe(
        &self,
        stream: StreamId,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriptionId {
        self.insert(stream, subscriber, None).await
    }

    /// Add an Active subscription that resumes from a known checkpoint:
    /// events with a sequence below `resume_cursor` are suppressed, so the
    /// consumer sees exactly the earliest undelivered event first.
    pub async fn subscribe_from(
        &self,
        stream: StreamId,
        subscriber: Arc<dyn Subscriber>,
        resume_cursor: u64,
    ) -> SubscriptionId {
        self.insert(stream, subscriber, Some(resume_cursor)).await
    }

    async fn insert(
        &self,
        stream: StreamId,
        subscriber: Arc<dyn Subscriber>,
        resume_from: Option<u64>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let mut subs = self.subscriptions.write().await;
        subs.insert(
            id,
            Subscription {
                stream: stream.clone(),
                subscriber,
                state: SubscriptionState::Active,
                resume_from,
            },
        );

        info!(
            subscription = %id,
            stream = %stream,
            resume_from = ?resume_from,
            "Subscription added"
        );
        id
    }

    /// Remove a subscription. Other subscriptions on the same stream are
    /// unaffected.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs
            .remove(&id)
            .ok_or(AgentError::SubscriptionNotFound(id))?;

        info!(subscription = %id, stream = %sub.stream, "Subscription removed");
        Ok(())
    }

    /// Mark a subscription Inactive (consumer transiently disappeared).
    /// Events arriving while Inactive are buffered up to the configured
    /// bound. Idempotent.
    pub async fn deactivate(&self, id: SubscriptionId) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs
            .get_mut(&id)
            .ok_or(AgentError::SubscriptionNotFound(id))?;

        if matches!(sub.state, SubscriptionState::Inactive { .. }) {
            return Ok(());
        }

        sub.state = SubscriptionState::Inactive {
            since: Instant::now(),
            buffer: VecDeque::new(),
        };
        let subscriber = Arc::clone(&sub.subscriber);
        info!(subscription = %id, stream = %sub.stream, "Subscription deactivated");

        subscriber.on_deactivate().await;
        Ok(())
    }

    /// Reactivate an Inactive subscription within its grace window, flushing
    /// buffered events in original order before any newer event. Past the
    /// window the subscription no longer exists.
    pub async fn resubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs
            .get_mut(&id)
            .ok_or(AgentError::SubscriptionNotFound(id))?;

        let expired = matches!(
            &sub.state,
            SubscriptionState::Inactive { since, .. } if since.elapsed() > self.inactive_grace
        );
        if expired {
            subs.remove(&id);
            warn!(subscription = %id, "Resubscribe past grace window; subscription dropped");
            return Err(AgentError::GraceWindowExpired(id));
        }

        let buffered = match &mut sub.state {
            SubscriptionState::Active => return Ok(()),
            SubscriptionState::Inactive { buffer, .. } => std::mem::take(buffer),
        };
        sub.state = SubscriptionState::Active;
        let subscriber = Arc::clone(&sub.subscriber);
        let flush_count = buffered.len();

        for event in buffered {
            if let Err(error) = subscriber.deliver(event).await {
                warn!(
                    subscription = %id,
                    error = %error,
                    "Subscriber failed during buffered flush; removing subscription"
                );
                subscriber.on_error(&error).await;
                let reason = error.to_string();
                subs.remove(&id);
                return Err(AgentError::Delivery {
                    subscription: id,
                    reason,
                });
            }
        }

        info!(
            subscription = %id,
            flushed = flush_count,
            "Subscription reactivated"
        );
        Ok(())
    }

    /// Fan one event out to every subscription matching its stream.
    ///
    /// Returns the number of Active subscriptions the event was delivered
    /// to. Inactive subscriptions buffer (or drop past the bound); expired
    /// ones are removed; a failing subscriber is removed without affecting
    /// the rest.
    pub async fn deliver(&self, event: &StreamEvent) -> usize {
        let mut subs = self.subscriptions.write().await;

        let mut to_deliver: Vec<(SubscriptionId, Arc<dyn Subscriber>)> = Vec::new();
        let mut expired: Vec<SubscriptionId> = Vec::new();

        for (id, sub) in subs.iter_mut().filter(|(_, s)| s.stream == event.stream) {
            if let Some(resume) = sub.resume_from {
                if event.sequence < resume {
                    continue;
                }
            }

            match &mut sub.state {
                SubscriptionState::Active => {
                    to_deliver.push((*id, Arc::clone(&sub.subscriber)));
                }
                SubscriptionState::Inactive { since, buffer } => {
                    if since.elapsed() > self.inactive_grace {
                        expired.push(*id);
                    } else if buffer.len() >= self.inactive_buffer_limit {
                        warn!(
                            subscription = %id,
                            stream = %event.stream,
                            limit = self.inactive_buffer_limit,
                            "Inactive buffer full, dropping event"
                        );
                    } else {
                        buffer.push_back(event.clone());
                    }
                }
            }
        }

        for id in expired {
            subs.remove(&id);
            info!(subscription = %id, "Inactive subscription expired, removed");
        }

        let mut delivered = 0;
        for (id, subscriber) in to_deliver {
            match subscriber.deliver(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(
                        subscription = %id,
                        stream = %event.stream,
                        error = %error,
                        "Subscriber failed, removing subscription"
                    );
                    subscriber.on_error(&error).await;
                    subs.remove(&id);
                }
            }
        }

        debug!(
            stream = %event.stream,
            sequence = event.sequence,
            delivered = delivered,
            "Event fanned out"
        );
        delivered
    }

    /// True when any subscription on `stream` has a full inactive buffer —
    /// the agent's admission-control signal to suspend pulls.
    pub async fn is_backlogged(&self, stream: &StreamId) -> bool {
        let subs = self.subscriptions.read().await;
        subs.values().any(|s| {
            s.stream == *stream
                && matches!(
                    &s.state,
                    SubscriptionState::Inactive { buffer, .. }
                        if buffer.len() >= self.inactive_buffer_limit
                )
        })
    }

    /// Number of Active subscriptions on `stream`.
    pub async fn active_count(&self, stream: &StreamId) -> usize {
        let subs = self.subscriptions.read().await;
        subs.values()
            .filter(|s| s.stream == *stream && matches!(s.state, SubscriptionState::Active))
            .count()
    }

    /// Total subscriptions (any state).
    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::Mutex;

    /// Subscriber that records delivered sequences.
    struct RecordingSubscriber {
        seen: Mutex<Vec<u64>>,
        deactivations: Mutex<u32>,
    }

    impl RecordingSubscriber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                deactivations: Mutex::new(0),
            })
        }

        async fn seen(&self) -> Vec<u64> {
            self.seen.lock().await.clone()
        }
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn deliver(&self, event: StreamEvent) -> std::result::Result<(), SubscriberError> {
            self.seen.lock().await.push(event.sequence);
            Ok(())
        }

        async fn on_deactivate(&self) {
            *self.deactivations.lock().await += 1;
        }
    }

    /// Subscriber that always fails.
    struct FailingSubscriber {
        errors: Mutex<u32>,
    }

    #[async_trait]
    impl Subscriber for FailingSubscriber {
        async fn deliver(&self, _event: StreamEvent) -> std::result::Result<(), SubscriberError> {
            Err("consumer exploded".into())
        }

        async fn on_error(&self, _error: &SubscriberError) {
            *self.errors.lock().await += 1;
        }
    }

    fn event(stream: &StreamId, sequence: u64) -> StreamEvent {
        StreamEvent::new(stream.clone(), sequence, 0, Bytes::from_static(b"e"))
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Duration::from_secs(30), 8)
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscriptions() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");
        let a = RecordingSubscriber::new();
        let b = RecordingSubscriber::new();

        registry.subscribe(stream.clone(), a.clone()).await;
        registry.subscribe(stream.clone(), b.clone()).await;

        for seq in 0..3 {
            assert_eq!(registry.deliver(&event(&stream, seq)).await, 2);
        }

        assert_eq!(a.seen().await, vec![0, 1, 2]);
        assert_eq!(b.seen().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_streams_do_not_cross() {
        let registry = registry();
        let red = StreamId::new("ns", "red");
        let blue = StreamId::new("ns", "blue");
        let sub = RecordingSubscriber::new();

        registry.subscribe(red.clone(), sub.clone()).await;

        registry.deliver(&event(&red, 0)).await;
        registry.deliver(&event(&blue, 100)).await;

        assert_eq!(sub.seen().await, vec![0]);
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_others_running() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");
        let a = RecordingSubscriber::new();
        let b = RecordingSubscriber::new();
        let c = RecordingSubscriber::new();

        registry.subscribe(stream.clone(), a.clone()).await;
        let mid = registry.subscribe(stream.clone(), b.clone()).await;
        registry.subscribe(stream.clone(), c.clone()).await;

        registry.deliver(&event(&stream, 0)).await;
        registry.unsubscribe(mid).await.unwrap();
        registry.deliver(&event(&stream, 1)).await;

        assert_eq!(a.seen().await, vec![0, 1]);
        assert_eq!(b.seen().await, vec![0], "removed subscription must stop immediately");
        assert_eq!(c.seen().await, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");
        let id = registry
            .subscribe(stream, RecordingSubscriber::new())
            .await;
        registry.unsubscribe(id).await.unwrap();

        let result = registry.unsubscribe(id).await;
        assert!(matches!(result, Err(AgentError::SubscriptionNotFound(_))));
    }

    #[tokio::test]
    async fn test_failing_subscriber_removed_others_unaffected() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");
        let good = RecordingSubscriber::new();
        let bad = Arc::new(FailingSubscriber {
            errors: Mutex::new(0),
        });

        registry.subscribe(stream.clone(), good.clone()).await;
        registry.subscribe(stream.clone(), bad.clone()).await;

        assert_eq!(registry.deliver(&event(&stream, 0)).await, 1);
        assert_eq!(*bad.errors.lock().await, 1);
        assert_eq!(registry.len().await, 1);

        // Subsequent delivery only reaches the healthy subscription.
        assert_eq!(registry.deliver(&event(&stream, 1)).await, 1);
        assert_eq!(good.seen().await, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_deactivate_buffers_then_flushes_in_order() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");
        let sub = RecordingSubscriber::new();

        let id = registry.subscribe(stream.clone(), sub.clone()).await;
        registry.deliver(&event(&stream, 0)).await;

        registry.deactivate(id).await.unwrap();
        assert_eq!(*sub.deactivations.lock().await, 1);

        // Buffered while inactive; not delivered yet.
        registry.deliver(&event(&stream, 1)).await;
        registry.deliver(&event(&stream, 2)).await;
        assert_eq!(sub.seen().await, vec![0]);

        // Resubscribe flushes in original order, then new events follow.
        registry.resubscribe(id).await.unwrap();
        registry.deliver(&event(&stream, 3)).await;
        assert_eq!(sub.seen().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");
        let sub = RecordingSubscriber::new();

        let id = registry.subscribe(stream.clone(), sub.clone()).await;
        registry.deactivate(id).await.unwrap();
        registry.deliver(&event(&stream, 0)).await;
        registry.deactivate(id).await.unwrap();

        // Second deactivate must not clear the buffer.
        registry.resubscribe(id).await.unwrap();
        assert_eq!(sub.seen().await, vec![0]);
    }

    #[tokio::test]
    async fn test_inactive_buffer_bound_and_backlog() {
        let registry = SubscriptionRegistry::new(Duration::from_secs(30), 2);
        let stream = StreamId::new("ns", "s");
        let sub = RecordingSubscriber::new();

        let id = registry.subscribe(stream.clone(), sub.clone()).await;
        registry.deactivate(id).await.unwrap();

        registry.deliver(&event(&stream, 0)).await;
        assert!(!registry.is_backlogged(&stream).await);
        registry.deliver(&event(&stream, 1)).await;
        assert!(registry.is_backlogged(&stream).await);

        // Past the bound the newest event is dropped.
        registry.deliver(&event(&stream, 2)).await;
        registry.resubscribe(id).await.unwrap();
        assert_eq!(sub.seen().await, vec![0, 1]);
        assert!(!registry.is_backlogged(&stream).await);
    }

    #[tokio::test]
    async fn test_resubscribe_past_grace_window() {
        let registry = SubscriptionRegistry::new(Duration::from_millis(20), 8);
        let stream = StreamId::new("ns", "s");
        let sub = RecordingSubscriber::new();

        let id = registry.subscribe(stream, sub).await;
        registry.deactivate(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = registry.resubscribe(id).await;
        assert!(matches!(result, Err(AgentError::GraceWindowExpired(_))));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_resume_cursor_suppresses_already_delivered() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");
        let sub = RecordingSubscriber::new();

        registry
            .subscribe_from(stream.clone(), sub.clone(), 3)
            .await;

        for seq in 0..5 {
            registry.deliver(&event(&stream, seq)).await;
        }

        assert_eq!(sub.seen().await, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_active_count() {
        let registry = registry();
        let stream = StreamId::new("ns", "s");

        let a = registry
            .subscribe(stream.clone(), RecordingSubscriber::new())
            .await;
        registry
            .subscribe(stream.clone(), RecordingSubscriber::new())
            .await;
        assert_eq!(registry.active_count(&stream).await, 2);

        registry.deactivate(a).await.unwrap();
        assert_eq!(registry.active_count(&stream).await, 1);
    }
}
