//! Publish/subscribe channels for realtime fan-out.
//!
//! Delivery is at-least-once to subscribers that are attached at publish
//! time. Nothing is retained: a subscriber that attaches after a publish
//! never sees it.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use shared::protocol::{ChannelEvent, ChannelName};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    /// Fire-and-forget; transport failures are logged, never returned.
    async fn publish(&self, channel: ChannelName, event: ChannelEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<ChannelEvent>,
}

/// In-process channel broker.
#[derive(Default, Clone)]
pub struct ChannelHub {
    inner: Arc<RwLock<HashMap<ChannelName, Vec<Subscriber>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, channel: ChannelName) -> Subscription {
        let (tx, rx) = unbounded_channel();
        let id = SubscriberId::new();

        let mut guard = self.inner.write().await;
        let subscribers = guard.entry(channel).or_default();
        subscribers.push(Subscriber { id, sender: tx });
        debug!(
            %channel,
            subscriber_id = ?id,
            total = subscribers.len(),
            "channel subscriber added"
        );

        Subscription {
            channel,
            id,
            hub: self.clone(),
            receiver: rx,
            handlers: HashMap::new(),
        }
    }

    pub async fn remove_subscriber(&self, channel: ChannelName, id: SubscriberId) {
        let mut guard = self.inner.write().await;
        if let Some(subscribers) = guard.get_mut(&channel) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                guard.remove(&channel);
            }
            debug!(%channel, subscriber_id = ?id, "channel subscriber removed");
        }
    }

    pub async fn subscriber_count(&self, channel: ChannelName) -> usize {
        let guard = self.inner.read().await;
        guard.get(&channel).map(Vec::len).unwrap_or(0)
    }

    /// Delivers to every live subscriber and prunes the ones whose receiver is gone.
    pub async fn broadcast(&self, channel: ChannelName, event: ChannelEvent) -> usize {
        let mut guard = self.inner.write().await;
        let Some(subscribers) = guard.get_mut(&channel) else {
            return 0;
        };

        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.sender.send(event.clone()).is_ok());
        let delivered = subscribers.len();
        if delivered != before {
            debug!(
                %channel,
                pruned = before - delivered,
                active = delivered,
                "dropped dead channel subscribers"
            );
        }
        if subscribers.is_empty() {
            guard.remove(&channel);
        }
        delivered
    }
}

#[async_trait]
impl ChannelPublisher for ChannelHub {
    async fn publish(&self, channel: ChannelName, event: ChannelEvent) {
        let name = event.name();
        let delivered = self.broadcast(channel, event).await;
        debug!(%channel, event = name, delivered, "published channel event");
    }
}

type EventHandler = Box<dyn Fn(&ChannelEvent) + Send + Sync>;

/// A live attachment to one channel.
///
/// Dropping the handle detaches it lazily (the hub prunes it on the next
/// publish); [`Subscription::unsubscribe`] detaches immediately.
pub struct Subscription {
    channel: ChannelName,
    id: SubscriberId,
    hub: ChannelHub,
    receiver: UnboundedReceiver<ChannelEvent>,
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Subscription {
    pub fn channel(&self) -> ChannelName {
        self.channel
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Registers a callback run by [`Subscription::recv`] for events named `event_name`.
    pub fn on<F>(&mut self, event_name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_name.into())
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Waits for the next event, runs the matching handlers and returns it.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.receiver.recv().await?;
        if let Some(handlers) = self.handlers.get(event.name()) {
            for handler in handlers {
                handler(&event);
            }
        }
        Some(event)
    }

    pub async fn unsubscribe(self) {
        self.hub.remove_subscriber(self.channel, self.id).await;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
