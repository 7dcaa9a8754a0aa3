// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the contract a message-queue driver must fulfil so
//! that brokers can run on top of it. It intentionally avoids any reference
//! to concrete protocols or client libraries.
//!
//! The transport is responsible for provisioning destinations, routing
//! published envelopes, delivering them to consumers, and recording
//! acknowledgements. Event dispatch, RPC correlation and timeouts are
//! handled by the broker layer.
//!
//! Concrete implementations live under `src/transport/`.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Transport-assigned identifier of one delivered message, used to
/// acknowledge it.
pub type DeliveryTag = u64;

/// A destination (queue) name.
///
/// Addresses are immutable, cheap to clone, and safe to share across
/// threads. The broker derives subscription addresses as
/// `"{group}_{event}"` (or the event name when no exchange is used);
/// ephemeral reply addresses are chosen by the transport.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options used when provisioning a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestinationOptions {
    /// Only the provisioning transport may consume from the destination.
    pub exclusive: bool,

    /// The destination is removed once its consumer goes away.
    pub auto_delete: bool,
}

impl DestinationOptions {
    /// A named destination shared by every consumer in a group.
    pub fn shared() -> Self {
        Self {
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A private, short-lived destination such as an RPC reply queue.
    ///
    /// Provisioning with an empty name asks the transport to pick a unique
    /// one.
    pub fn ephemeral() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Where a published envelope should go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Through a named exchange/topic; delivered to every destination bound
    /// with a matching routing key.
    Exchange {
        exchange: Arc<str>,
        routing_key: Arc<str>,
    },

    /// Straight to one destination, bypassing any exchange.
    Direct(Address),
}

impl Route {
    /// Route through `exchange` with `routing_key`.
    pub fn exchange(exchange: impl Into<Arc<str>>, routing_key: impl Into<Arc<str>>) -> Self {
        Route::Exchange {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Exchange {
                exchange,
                routing_key,
            } => write!(f, "{exchange}/{routing_key}"),
            Route::Direct(address) => write!(f, "direct:{address}"),
        }
    }
}

/// An opaque message envelope.
///
/// Outbound envelopes carry the payload and optional RPC metadata. On
/// delivery the transport fills in `routing_key` and `delivery_tag`.
///
/// # Examples
///
/// ```
/// # use mom_broker::{Envelope, Address};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let request = Envelope::request(
///     Bytes::from_static(b"{}"),
///     Arc::from("correlation-123"),
///     Address::from("reply.abc"),
///     Arc::from("application/json"),
/// );
/// assert!(request.reply_to.is_some());
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Encoded payload bytes, interpreted by the broker's codec.
    pub payload: Bytes,

    /// Correlation token associating a response with its request.
    pub correlation_id: Option<Arc<str>>,

    /// Destination to which a responder should send its reply.
    pub reply_to: Option<Address>,

    /// Payload format, informational only.
    pub content_type: Option<Arc<str>>,

    /// Routing key the message was published with (set on delivery).
    pub routing_key: Option<Arc<str>>,

    /// Acknowledgement handle (set on delivery).
    pub delivery_tag: Option<DeliveryTag>,
}

impl Envelope {
    // ---
    /// Create a plain pub/sub event envelope.
    pub fn event(payload: Bytes, content_type: Arc<str>) -> Self {
        // ---
        Self {
            payload,
            correlation_id: None,
            reply_to: None,
            content_type: Some(content_type),
            routing_key: None,
            delivery_tag: None,
        }
    }

    /// Create an RPC request envelope.
    pub fn request(
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
        content_type: Arc<str>,
    ) -> Self {
        // ---
        Self {
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(content_type),
            routing_key: None,
            delivery_tag: None,
        }
    }

    /// Create an RPC response envelope.
    pub fn response(payload: Bytes, correlation_id: Arc<str>, content_type: Arc<str>) -> Self {
        // ---
        Self {
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(content_type),
            routing_key: None,
            delivery_tag: None,
        }
    }
}

/// Handle returned from a successful `consume()`.
///
/// The inbox yields envelopes until the consumer is cancelled, the
/// destination is released, or the transport is closed. Dropping the
/// handle stops delivery to this consumer.
pub struct SubscriptionHandle {
    // ---
    /// The destination being consumed.
    pub address: Address,

    /// Envelopes delivered to this consumer, in transport order.
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

/// Transport adapter.
///
/// The minimal contract the brokers need from a message-queue driver.
///
/// Implementations must ensure that:
/// - `provision()` is idempotent for an existing shared destination.
/// - Once `consume()` returns, envelopes routed to the destination
///   afterwards, and any already waiting in it, are delivered to the inbox.
/// - Publishing to a destination that does not exist, or through an
///   exchange with no matching binding, silently drops the envelope.
/// - After `close()` every inbox handed out by this transport ends.
///
/// The in-memory transport is the reference implementation.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier used in log output.
    fn transport_id(&self) -> &str;

    /// Create (or assert) a destination and return its address.
    ///
    /// An empty `name` combined with [`DestinationOptions::ephemeral`] asks
    /// the transport to generate a unique name.
    async fn provision(&self, name: &str, opts: DestinationOptions) -> Result<Address>;

    /// Bind a destination to an exchange so envelopes published with
    /// `routing_key` reach it. Declares the exchange if needed.
    async fn bind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()>;

    /// Remove a binding created by [`bind`](Transport::bind).
    async fn unbind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish an envelope along `route`.
    async fn publish(&self, route: Route, env: Envelope) -> Result<()>;

    /// Start consuming a destination.
    async fn consume(&self, address: &Address) -> Result<SubscriptionHandle>;

    /// Confirm that a delivered envelope was processed.
    async fn acknowledge(&self, tag: DeliveryTag) -> Result<()>;

    /// Delete a destination, ending any consumers on it.
    async fn release(&self, address: &Address) -> Result<()>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap; all clones share the same underlying channel.
pub type TransportPtr = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_address_serializes_as_plain_string() {
        // ---
        let address = Address::from("workers_orders");
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"workers_orders\"");

        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "workers_orders");
    }
}
