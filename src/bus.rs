//! Named-channel publish/subscribe event bus.
//!
//! One logical channel per project, plus fine-grained channels per
//! (project, view, user) for watch subscriptions:
//! ```text
//! publisher ──► "project:{id}:updates" ──┬──► listener (process A)
//!                                        └──► listener (process B)
//! ```
//!
//! Delivery is at-most-once to the listeners subscribed at publish time and
//! FIFO within one channel of one bus instance. Nothing is buffered for
//! future subscribers and nothing is redelivered: a subscriber that lags past
//! its buffer capacity drops the oldest messages, which listeners observe as
//! a `Lagged` error and log.
//!
//! Each channel is a `tokio::sync::broadcast` pair created lazily on first
//! subscribe. Publishing to a channel nobody listens on is a cheap no-op.
//! Deployments that span processes put a networked broker behind the same
//! two calls; everything above the bus only sees `publish` and `subscribe`.

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::CollabError;
use crate::UserId;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Channel carrying every collaboration-visible change for a project.
pub fn project_channel(project_id: Uuid) -> String {
    format!("project:{project_id}:updates")
}

/// Fine-grained channel for one user's filter/sort preference on one view.
pub fn prefs_channel(project_id: Uuid, view_id: Uuid, user_id: UserId) -> String {
    format!("project:{project_id}:views:{view_id}:users:{user_id}:prefs")
}

/// Channel carrying one user's preference changes across all views.
pub fn user_prefs_channel(project_id: Uuid, user_id: UserId) -> String {
    format!("project:{project_id}:users:{user_id}:prefs")
}

/// In-process event bus with named channels.
pub struct MemoryBus {
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Publish a payload to a channel, fire-and-forget.
    ///
    /// Returns the number of subscribers the payload reached. Zero is not an
    /// error: channels with no listeners swallow publishes by design.
    pub async fn publish(&self, channel: &str, payload: String) -> Result<usize, CollabError> {
        let channels = self.channels.read().await;
        match channels.get(channel) {
            // send() errs only when every receiver is gone; same as no channel.
            Some(sender) => Ok(sender.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Subscribe to a channel, creating it if it does not exist yet.
    ///
    /// The receiver observes messages published after this call, in publish
    /// order, for as long as it is held.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        // Fast path: channel already exists.
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(channel) {
                return sender.subscribe();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring the write lock.
        if let Some(sender) = channels.get(channel) {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(self.capacity);
        channels.insert(channel.to_owned(), sender);
        receiver
    }

    /// Drop a channel that no longer has any subscribers.
    pub async fn remove_if_idle(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(channel) {
            if sender.receiver_count() == 0 {
                channels.remove(channel);
                return true;
            }
        }
        false
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Number of subscribers currently attached to a channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |s| s.receiver_count())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = MemoryBus::default();
        let delivered = bus.publish("project:x:updates", "hello".into()).await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() {
        let bus = MemoryBus::default();
        let mut rx = bus.subscribe("chan").await;

        let delivered = bus.publish("chan", "one".into()).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), "one");
    }

    #[tokio::test]
    async fn test_fifo_within_channel() {
        let bus = MemoryBus::default();
        let mut rx = bus.subscribe("chan").await;

        for i in 0..5 {
            bus.publish("chan", format!("msg-{i}")).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryBus::default();
        let mut rx_a = bus.subscribe("a").await;
        let mut rx_b = bus.subscribe("b").await;

        bus.publish("a", "for-a".into()).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), "for-a");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_messages() {
        let bus = MemoryBus::default();
        let _early = bus.subscribe("chan").await;
        bus.publish("chan", "before".into()).await.unwrap();

        let mut late = bus.subscribe("chan").await;
        bus.publish("chan", "after".into()).await.unwrap();
        assert_eq!(late.recv().await.unwrap(), "after");
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_drops_oldest() {
        let bus = MemoryBus::new(2);
        let mut rx = bus.subscribe("chan").await;

        for i in 0..4 {
            bus.publish("chan", format!("m{i}")).await.unwrap();
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // The newest messages are still deliverable.
        assert_eq!(rx.recv().await.unwrap(), "m2");
        assert_eq!(rx.recv().await.unwrap(), "m3");
    }

    #[tokio::test]
    async fn test_remove_if_idle() {
        let bus = MemoryBus::default();
        {
            let _rx = bus.subscribe("chan").await;
            assert!(!bus.remove_if_idle("chan").await);
        }
        // Receiver dropped.
        assert!(bus.remove_if_idle("chan").await);
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = MemoryBus::default();
        assert_eq!(bus.subscriber_count("chan").await, 0);
        let _rx1 = bus.subscribe("chan").await;
        let _rx2 = bus.subscribe("chan").await;
        assert_eq!(bus.subscriber_count("chan").await, 2);
    }

    #[test]
    fn test_channel_names() {
        let project = Uuid::nil();
        assert_eq!(
            project_channel(project),
            "project:00000000-0000-0000-0000-000000000000:updates"
        );
        let view = Uuid::nil();
        assert!(prefs_channel(project, view, 7).ends_with(":users:7:prefs"));
        assert!(prefs_channel(project, view, 7).contains(":views:"));
        assert!(!user_prefs_channel(project, 7).contains(":views:"));
    }
}
