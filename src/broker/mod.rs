//! Broker façades.
//!
//! [`PubSubBroker`] publishes and consumes fire-and-forget events;
//! [`RpcBroker`] sends requests and serves them. Both are built by
//! [`BrokerBuilder`](crate::BrokerBuilder) and share subscription handling,
//! dispatch, and the error channel.

mod pubsub;
mod rpc;
mod shared;

pub use pubsub::PubSubBroker;
pub use rpc::RpcBroker;
pub(crate) use shared::BrokerCore;
