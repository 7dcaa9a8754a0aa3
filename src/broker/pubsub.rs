//! Publish/subscribe broker.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::broker::BrokerCore;
use crate::dispatch::{ListenerId, Listeners};
use crate::{
    // ---
    BrokerConfig,
    BrokerError,
    Envelope,
    EventMessage,
    Result,
};

/// Fire-and-forget event broker.
///
/// Listeners are registered per event name with [`on`](Self::on) and run
/// for every message delivered to a destination this broker subscribed
/// with [`subscribe`](Self::subscribe). Brokers sharing a group compete for
/// messages; brokers in different groups each receive a copy.
///
/// Cloning is cheap and every clone drives the same broker.
///
/// # Example
///
/// ```no_run
/// use mom_broker::BrokerBuilder;
///
/// # async fn example() -> mom_broker::Result<()> {
/// let transport = mom_broker::create_memory_transport("billing").await?;
/// let broker = BrokerBuilder::new().transport(transport).build_pubsub()?;
///
/// broker.on("orders", |msg| async move {
///     println!("order: {}", msg.data());
///     msg.acknowledge().await
/// });
/// broker.subscribe("workers", &["orders"]).await?;
///
/// broker.publish("orders", &serde_json::json!({"id": 1})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PubSubBroker {
    core: Arc<BrokerCore>,
    listeners: Arc<Listeners<EventMessage>>,
}

fn build_event(core: &BrokerCore, event: &str, data: Value, env: &Envelope) -> EventMessage {
    EventMessage::new(event, data, env.delivery_tag, core.transport().clone())
}

impl PubSubBroker {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        Self {
            core: Arc::new(BrokerCore::new(config)),
            listeners: Arc::new(Listeners::new()),
        }
    }

    /// Configuration the broker was built with.
    pub fn config(&self) -> &BrokerConfig {
        self.core.config()
    }

    /// Register `listener` for `event`.
    ///
    /// Listeners for the same event run one after another in registration
    /// order. An `Err` or panic from a listener is reported on the
    /// [error channel](Self::errors) and does not affect the others.
    pub fn on<F, Fut>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.listeners.add(event, listener)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.listeners.remove(event, id)
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.count(event)
    }

    /// Consume `events` on behalf of `group`.
    ///
    /// Each event maps to the destination `"{group}_{event}"`. Subscribing
    /// an event twice is a no-op.
    ///
    /// # Errors
    ///
    /// Stops at the first failing event and returns its error; events
    /// processed before it stay subscribed.
    pub async fn subscribe<S: AsRef<str>>(&self, group: &str, events: &[S]) -> Result<()> {
        self.core
            .subscribe(&self.listeners, group, events, build_event)
            .await
    }

    /// Stop routing `events` to `group`'s destinations. Unknown events are
    /// ignored.
    pub async fn unsubscribe<S: AsRef<str>>(&self, group: &str, events: &[S]) -> Result<()> {
        self.core.unsubscribe(group, events).await
    }

    /// Event names currently subscribed, sorted.
    pub async fn subscribed_events(&self) -> Vec<String> {
        self.core.registry.subscribed_events().await
    }

    /// Encode `data` and publish it for `event`.
    ///
    /// # Errors
    ///
    /// Serialization, transport, or [`BrokerError::Destroyed`].
    pub async fn publish<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> Result<()> {
        // ---
        self.core.ensure_live()?;
        let payload = self.core.encode(data)?;
        self.core.publish_event(event, payload).await
    }

    /// Receive asynchronous failures: listener errors, undecodable
    /// messages, and receive loops ended by the transport.
    pub fn errors(&self) -> broadcast::Receiver<Arc<BrokerError>> {
        self.core.errors.subscribe()
    }

    /// Stop every receive loop and close the transport.
    ///
    /// Later operations fail with [`BrokerError::Destroyed`]. Calling it
    /// again is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        // ---
        if !self.core.mark_destroyed() {
            return Ok(());
        }
        self.core.teardown().await
    }
}

impl std::fmt::Debug for PubSubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubBroker")
            .field("config", self.core.config())
            .field("destroyed", &self.core.is_destroyed())
            .finish()
    }
}
