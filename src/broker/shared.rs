//! State common to both broker flavors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::dispatch::{self, ErrorSink, Listeners};
use crate::registry::SubscriptionRegistry;
use crate::{
    // ---
    log_debug,
    log_info,
    Address,
    BrokerConfig,
    BrokerError,
    CodecPtr,
    Envelope,
    Result,
    Route,
    TransportPtr,
};

pub(crate) struct BrokerCore {
    config: BrokerConfig,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) errors: ErrorSink,
    destroyed: AtomicBool,
}

impl BrokerCore {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        // ---
        let errors = ErrorSink::new(config.error_capacity());
        Self {
            config,
            registry: SubscriptionRegistry::new(),
            errors,
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &TransportPtr {
        self.config.transport()
    }

    pub(crate) fn codec(&self) -> &CodecPtr {
        self.config.codec()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(BrokerError::Destroyed);
        }
        Ok(())
    }

    /// Where messages for `event` are published.
    pub(crate) fn route_for(&self, event: &str) -> Result<Route> {
        // ---
        if event.is_empty() {
            return Err(BrokerError::InvalidName("event must not be empty".into()));
        }
        Ok(match &self.config.exchange {
            Some(exchange) => Route::exchange(exchange.clone(), event),
            None => Route::Direct(Address::from(event)),
        })
    }

    pub(crate) fn encode<T: Serialize + ?Sized>(&self, data: &T) -> Result<Bytes> {
        let value = serde_json::to_value(data)?;
        self.codec().encode(&value)
    }

    pub(crate) fn content_type(&self) -> Arc<str> {
        Arc::from(self.codec().content_type())
    }

    /// Subscribe `events` for `group`, starting a receive loop that hands
    /// messages built by `build` to `listeners`.
    pub(crate) async fn subscribe<M, S, B>(
        self: &Arc<Self>,
        listeners: &Arc<Listeners<M>>,
        group: &str,
        events: &[S],
        build: B,
    ) -> Result<()>
    where
        M: Clone + Send + 'static,
        S: AsRef<str>,
        B: Fn(&BrokerCore, &str, Value, &Envelope) -> M + Clone + Send + Sync + 'static,
    {
        // ---
        self.ensure_live()?;

        self.registry
            .subscribe(
                self.transport(),
                self.config.exchange(),
                group,
                events,
                |event, handle| {
                    dispatch::spawn_consumer(
                        self.clone(),
                        listeners.clone(),
                        event,
                        handle,
                        build.clone(),
                    )
                },
            )
            .await
    }

    pub(crate) async fn unsubscribe<S: AsRef<str>>(&self, group: &str, events: &[S]) -> Result<()> {
        // ---
        self.ensure_live()?;
        self.registry
            .unsubscribe(self.transport(), self.config.exchange(), group, events)
            .await
    }

    /// Flag the broker destroyed. Returns `false` if it already was.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    /// Stop every receive loop and close the transport.
    pub(crate) async fn teardown(&self) -> Result<()> {
        // ---
        self.registry.shutdown().await;
        self.transport().close().await?;
        log_info!("{}: broker destroyed", self.transport().transport_id());
        Ok(())
    }

    pub(crate) async fn publish_event(&self, event: &str, payload: Bytes) -> Result<()> {
        // ---
        let route = self.route_for(event)?;
        log_debug!("publishing {event} via {route}");
        let env = Envelope::event(payload, self.content_type());
        self.transport().publish(route, env).await
    }
}
