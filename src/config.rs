//! Broker configuration.
//!
//! A [`BrokerConfig`] is built once by
//! [`BrokerBuilder`](crate::BrokerBuilder), validated eagerly, and never
//! mutated afterwards. Every broker keeps its own copy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{CodecPtr, TransportPtr};

/// Deadline applied to [`RpcBroker::call`](crate::RpcBroker::call) when no
/// per-call timeout is given.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Exchange used by pub/sub brokers unless overridden.
pub const DEFAULT_PUBSUB_EXCHANGE: &str = "mom.events";

/// Exchange used by RPC brokers unless overridden.
pub const DEFAULT_RPC_EXCHANGE: &str = "mom.rpc";

/// Buffered reports per error-channel receiver before the oldest are
/// dropped.
pub const DEFAULT_ERROR_CAPACITY: usize = 64;

/// Immutable broker configuration.
#[derive(Clone)]
pub struct BrokerConfig {
    // ---
    pub(crate) transport: TransportPtr,
    pub(crate) codec: CodecPtr,
    pub(crate) exchange: Option<Arc<str>>,
    pub(crate) call_timeout: Duration,
    pub(crate) error_capacity: usize,
}

impl BrokerConfig {
    /// Transport shared by every subscription and call of the broker.
    pub fn transport(&self) -> &TransportPtr {
        &self.transport
    }

    /// Payload codec.
    pub fn codec(&self) -> &CodecPtr {
        &self.codec
    }

    /// Exchange that subscriptions are bound to and events are published
    /// through. `None` means events are published straight to a destination
    /// named after the event.
    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    /// Default RPC deadline.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Error-channel capacity.
    pub fn error_capacity(&self) -> usize {
        self.error_capacity
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("transport", &self.transport.transport_id())
            .field("content_type", &self.codec.content_type())
            .field("exchange", &self.exchange)
            .field("call_timeout", &self.call_timeout)
            .field("error_capacity", &self.error_capacity)
            .finish()
    }
}
