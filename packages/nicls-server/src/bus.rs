//! In-process publish/subscribe bus.
//!
//! Producers and consumers never hold references to each other: a producer
//! publishes under its own [`PublisherId`] on a [`Topic`], and consumers
//! register handlers for that `(topic, publisher)` pair. Topics are types, so
//! a handler can only ever receive the payload type its topic declares.
//!
//! Delivery is synchronous fan-out in the publisher's context. Nothing is
//! queued or persisted; a message published with no subscribers is dropped.
//! Handler errors are not swallowed: the first failing handler aborts the
//! fan-out and its error is returned to the publisher.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Result returned by bus handlers
pub type HandlerResult = anyhow::Result<()>;

/// A compile-time topic identifier and its payload type
pub trait Topic: 'static {
    /// Name used in traces
    const NAME: &'static str;
    /// Payload delivered to subscribers
    type Message: Send + Sync + 'static;
}

/// Opaque identity of a publishing component
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublisherId(String);

impl PublisherId {
    /// Generate a fresh random publisher id
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Use a well-known fixed name
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PublisherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Errors surfaced to publishers
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("{topic} handler for publisher {publisher} failed: {error:#}")]
    Handler {
        topic: &'static str,
        publisher: PublisherId,
        error: anyhow::Error,
    },
}

type Handler<M> = Arc<dyn Fn(&M) -> HandlerResult + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    // Always a `Handler<T::Message>` for the topic in the channel key
    handler: Arc<dyn Any + Send + Sync>,
}

type ChannelKey = (TypeId, PublisherId);

/// Shared publish/subscribe registry
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<ChannelKey, Vec<Subscription>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for messages on topic `T` from `publisher`
    #[track_caller]
    pub fn subscribe<T, F>(&self, publisher: &PublisherId, handler: F) -> SubscriptionId
    where
        T: Topic,
        F: Fn(&T::Message) -> HandlerResult + Send + Sync + 'static,
    {
        let caller = Location::caller();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler<T::Message> = Arc::new(handler);

        self.channels
            .write()
            .entry((TypeId::of::<T>(), publisher.clone()))
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });

        debug!(
            topic = T::NAME,
            publisher = %publisher,
            subscription = id.0,
            caller = %caller,
            "subscribe"
        );
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    #[track_caller]
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let caller = Location::caller();
        let mut channels = self.channels.write();
        let mut removed = false;
        channels.retain(|_, subscriptions| {
            let before = subscriptions.len();
            subscriptions.retain(|s| s.id != id);
            removed |= subscriptions.len() != before;
            !subscriptions.is_empty()
        });

        debug!(
            subscription = id.0,
            removed,
            caller = %caller,
            "unsubscribe"
        );
        removed
    }

    /// Deliver `message` to every handler currently subscribed to
    /// `(T, publisher)`. Returns how many handlers ran.
    #[track_caller]
    pub fn publish<T: Topic>(
        &self,
        publisher: &PublisherId,
        message: &T::Message,
    ) -> Result<usize, BusError> {
        let caller = Location::caller();
        let handlers = self.handlers::<T>(publisher);

        debug!(
            topic = T::NAME,
            publisher = %publisher,
            subscribers = handlers.len(),
            caller = %caller,
            "publish"
        );

        for handler in &handlers {
            handler(message).map_err(|error| BusError::Handler {
                topic: T::NAME,
                publisher: publisher.clone(),
                error,
            })?;
        }

        Ok(handlers.len())
    }

    /// Number of handlers subscribed to `(T, publisher)`
    pub fn subscriber_count<T: Topic>(&self, publisher: &PublisherId) -> usize {
        self.channels
            .read()
            .get(&(TypeId::of::<T>(), publisher.clone()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    // Snapshot so handlers may subscribe or publish without deadlocking
    fn handlers<T: Topic>(&self, publisher: &PublisherId) -> Vec<Handler<T::Message>> {
        self.channels
            .read()
            .get(&(TypeId::of::<T>(), publisher.clone()))
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .filter_map(|s| s.handler.downcast_ref::<Handler<T::Message>>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}
