//! Publish/subscribe and request/reply messaging over pluggable
//! message-queue transports.
//!
//! Two broker flavors are built with [`BrokerBuilder`]:
//!
//! - [`PubSubBroker`] publishes events and dispatches delivered ones to
//!   listeners registered per event name.
//! - [`RpcBroker`] sends requests that expect exactly one reply, matched by
//!   a correlation token and bounded by a deadline, and serves requests
//!   through responder listeners.
//!
//! Subscribers join a *group*; every event maps to the destination
//! `"{group}_{event}"`, so brokers in one group compete for messages while
//! brokers in different groups each get a copy.
//!
//! Wire access goes through the [`Transport`] trait. The in-memory transport
//! ([`create_memory_transport`]) ships with the crate; an AMQP transport is
//! available behind the `transport_lapin` feature.
//!
//! ```no_run
//! use mom_broker::BrokerBuilder;
//! use serde_json::json;
//!
//! # async fn example() -> mom_broker::Result<()> {
//! let transport = mom_broker::create_memory_transport("shop").await?;
//! let events = BrokerBuilder::new().transport(transport).build_pubsub()?;
//!
//! events.on("orders", |msg| async move {
//!     println!("{}", msg.data());
//!     msg.acknowledge().await
//! });
//! events.subscribe("workers", &["orders"]).await?;
//! events.publish("orders", &json!({"id": 7})).await?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod broker_builder;
mod codec;
mod config;
mod correlation;
mod correlator;
mod dispatch;
mod domain;
mod error;
mod macros;
mod message;
mod registry;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

pub use broker::{PubSubBroker, RpcBroker};
pub use broker_builder::BrokerBuilder;
pub use codec::{Codec, CodecPtr, JsonCodec};
pub use config::{
    // ---
    BrokerConfig,
    DEFAULT_CALL_TIMEOUT,
    DEFAULT_ERROR_CAPACITY,
    DEFAULT_PUBSUB_EXCHANGE,
    DEFAULT_RPC_EXCHANGE,
};
pub use correlation::CorrelationId;
pub use dispatch::ListenerId;
pub use error::{BrokerError, Result};
pub use message::{EventMessage, RpcRequest};
pub use registry::destination_name;

pub use transport::{
    // ---
    create_lapin_transport,
    create_memory_transport,
    create_memory_transport_with_hub,
    MemoryHub,
};

// --- public re-exports
pub use domain::{
    //
    Address,
    DeliveryTag,
    DestinationOptions,
    Envelope,
    Route,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};
