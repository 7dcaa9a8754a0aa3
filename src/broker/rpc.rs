//! Request/reply broker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::broker::BrokerCore;
use crate::correlator::Correlator;
use crate::dispatch::{ListenerId, Listeners};
use crate::{
    // ---
    BrokerConfig,
    BrokerError,
    Envelope,
    EventMessage,
    Result,
    RpcRequest,
};

/// Request/reply broker.
///
/// A broker can call, serve, or both. Callers use [`call`](Self::call);
/// responders register listeners with [`on`](Self::on), subscribe a group,
/// and answer through [`RpcRequest::reply`].
///
/// Each call waits on its own reply destination, so concurrent calls never
/// see each other's replies. Only the first reply for a call counts.
///
/// # Example
///
/// ```no_run
/// use mom_broker::BrokerBuilder;
/// use serde_json::{json, Value};
///
/// # async fn example() -> mom_broker::Result<()> {
/// let transport = mom_broker::create_memory_transport("pricing").await?;
/// let broker = BrokerBuilder::new().transport(transport).build_rpc()?;
///
/// broker.on("price", |req| async move {
///     req.reply(json!({"cents": 1250})).await?;
///     req.acknowledge().await
/// });
/// broker.subscribe("pricing", &["price"]).await?;
///
/// let price: Value = broker.call("price", &json!({"sku": "A-1"})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcBroker {
    core: Arc<BrokerCore>,
    listeners: Arc<Listeners<RpcRequest>>,
    correlator: Arc<Correlator>,
}

fn build_request(core: &BrokerCore, event: &str, data: Value, env: &Envelope) -> RpcRequest {
    let message = EventMessage::new(event, data, env.delivery_tag, core.transport().clone());
    RpcRequest::new(message, env, core.codec().clone())
}

impl RpcBroker {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        // ---
        let correlator = Correlator::new(config.transport().clone(), config.codec().clone());
        Self {
            core: Arc::new(BrokerCore::new(config)),
            listeners: Arc::new(Listeners::new()),
            correlator: Arc::new(correlator),
        }
    }

    /// Configuration the broker was built with.
    pub fn config(&self) -> &BrokerConfig {
        self.core.config()
    }

    /// Register a responder for `event`.
    ///
    /// Responders run in registration order; each may reply, but the
    /// caller only honors the first reply.
    pub fn on<F, Fut>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.listeners.add(event, listener)
    }

    /// Remove a responder. Returns `false` if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.listeners.remove(event, id)
    }

    /// Number of responders registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.count(event)
    }

    /// Serve requests for `events` on behalf of `group`.
    ///
    /// # Errors
    ///
    /// See [`PubSubBroker::subscribe`](crate::PubSubBroker::subscribe).
    pub async fn subscribe<S: AsRef<str>>(&self, group: &str, events: &[S]) -> Result<()> {
        self.core
            .subscribe(&self.listeners, group, events, build_request)
            .await
    }

    /// Stop serving `events` for `group`.
    pub async fn unsubscribe<S: AsRef<str>>(&self, group: &str, events: &[S]) -> Result<()> {
        self.core.unsubscribe(group, events).await
    }

    /// Event names currently served, sorted.
    pub async fn subscribed_events(&self) -> Vec<String> {
        self.core.registry.subscribed_events().await
    }

    /// Call `event` with the broker's default deadline.
    ///
    /// # Errors
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call<TReq, TResp>(&self, event: &str, request: &TReq) -> Result<TResp>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        let timeout = self.core.config().call_timeout();
        self.call_with_timeout(event, request, timeout).await
    }

    /// Call `event` and wait up to `timeout` for the first reply.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Timeout`] if no reply arrives in time
    /// - [`BrokerError::Transport`] if the request cannot be sent
    /// - [`BrokerError::Destroyed`] if the broker is destroyed before a
    ///   reply arrives
    /// - serialization errors for the request or the reply
    pub async fn call_with_timeout<TReq, TResp>(
        &self,
        event: &str,
        request: &TReq,
        timeout: Duration,
    ) -> Result<TResp>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        // ---
        self.core.ensure_live()?;
        let route = self.core.route_for(event)?;
        let payload = self.core.encode(request)?;

        let value = self.correlator.call(route, payload, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Calls still waiting for an outcome.
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Receive asynchronous failures: responder errors, undecodable
    /// requests, and receive loops ended by the transport.
    pub fn errors(&self) -> broadcast::Receiver<Arc<BrokerError>> {
        self.core.errors.subscribe()
    }

    /// Reject outstanding calls with [`BrokerError::Destroyed`], stop every
    /// receive loop, and close the transport.
    ///
    /// Later operations fail with [`BrokerError::Destroyed`]. Calling it
    /// again is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        // ---
        if !self.core.mark_destroyed() {
            return Ok(());
        }
        self.correlator.reject_all().await;
        self.core.teardown().await
    }
}

impl std::fmt::Debug for RpcBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcBroker")
            .field("config", self.core.config())
            .field("pending_calls", &self.correlator.pending_count())
            .field("destroyed", &self.core.is_destroyed())
            .finish()
    }
}
