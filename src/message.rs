//! Handler payloads passed to listeners.
//!
//! Both types are cheap to clone; every listener registered for an event
//! receives a clone of the same message, so acknowledging through any clone
//! acknowledges it for all of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{
    // ---
    log_debug,
    Address,
    BrokerError,
    CodecPtr,
    DeliveryTag,
    Envelope,
    Result,
    Route,
    TransportPtr,
};

struct Inner {
    event: String,
    data: Value,
    delivery_tag: Option<DeliveryTag>,
    acked: AtomicBool,
    transport: TransportPtr,
}

/// An inbound pub/sub event.
///
/// Acknowledging is the listener's job. The broker never acknowledges on a
/// listener's behalf, so a message that no listener acknowledges stays
/// unconfirmed at the transport. Delivery is at-least-once only to the
/// extent listeners acknowledge correctly.
#[derive(Clone)]
pub struct EventMessage {
    inner: Arc<Inner>,
}

impl EventMessage {
    pub(crate) fn new(
        event: impl Into<String>,
        data: Value,
        delivery_tag: Option<DeliveryTag>,
        transport: TransportPtr,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                event: event.into(),
                data,
                delivery_tag,
                acked: AtomicBool::new(false),
                transport,
            }),
        }
    }

    /// Event name the message was delivered for.
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Decoded payload.
    pub fn data(&self) -> &Value {
        &self.inner.data
    }

    /// Decoded payload converted into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.inner.data)?)
    }

    /// Whether [`acknowledge`](Self::acknowledge) has succeeded.
    pub fn is_acknowledged(&self) -> bool {
        self.inner.acked.load(Ordering::Acquire)
    }

    /// Confirm processing to the transport so the message is not
    /// redelivered. Calling it again after success is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the confirmation could not be sent;
    /// the message then counts as unacknowledged and the call may be
    /// retried.
    pub async fn acknowledge(&self) -> Result<()> {
        // ---
        if self.inner.acked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(tag) = self.inner.delivery_tag else {
            return Ok(());
        };

        if let Err(err) = self.inner.transport.acknowledge(tag).await {
            self.inner.acked.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMessage")
            .field("event", &self.inner.event)
            .field("data", &self.inner.data)
            .field("delivery_tag", &self.inner.delivery_tag)
            .finish()
    }
}

struct ReplyTarget {
    reply_to: Option<Address>,
    correlation_id: Option<Arc<str>>,
    codec: CodecPtr,
}

/// An inbound RPC request.
///
/// Besides the [`EventMessage`] surface it can [`reply`](Self::reply) to the
/// caller.
#[derive(Clone)]
pub struct RpcRequest {
    message: EventMessage,
    target: Arc<ReplyTarget>,
}

impl RpcRequest {
    pub(crate) fn new(message: EventMessage, env: &Envelope, codec: CodecPtr) -> Self {
        Self {
            message,
            target: Arc::new(ReplyTarget {
                reply_to: env.reply_to.clone(),
                correlation_id: env.correlation_id.clone(),
                codec,
            }),
        }
    }

    /// Event name the request was delivered for.
    pub fn event(&self) -> &str {
        self.message.event()
    }

    /// Decoded request payload.
    pub fn data(&self) -> &Value {
        self.message.data()
    }

    /// Decoded request payload converted into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        self.message.data_as()
    }

    /// Correlation token of the request, if it carried one.
    pub fn correlation_id(&self) -> Option<&str> {
        self.target.correlation_id.as_deref()
    }

    /// Destination the caller waits on, if the request carried one.
    pub fn reply_to(&self) -> Option<&Address> {
        self.target.reply_to.as_ref()
    }

    /// See [`EventMessage::is_acknowledged`].
    pub fn is_acknowledged(&self) -> bool {
        self.message.is_acknowledged()
    }

    /// See [`EventMessage::acknowledge`].
    pub async fn acknowledge(&self) -> Result<()> {
        self.message.acknowledge().await
    }

    /// Encode `data` and send it to the caller, tagged with the request's
    /// correlation token.
    ///
    /// Each call sends one response message; the caller honors only the
    /// first.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::MissingReplyTo`] if the request had no reply
    ///   destination or correlation token
    /// - serialization or transport errors
    pub async fn reply<T: Serialize>(&self, data: T) -> Result<()> {
        // ---
        let (Some(reply_to), Some(correlation_id)) =
            (&self.target.reply_to, &self.target.correlation_id)
        else {
            return Err(BrokerError::MissingReplyTo);
        };

        let value = serde_json::to_value(data)?;
        let codec = &self.target.codec;
        let payload = codec.encode(&value)?;

        let env = Envelope::response(
            payload,
            correlation_id.clone(),
            Arc::from(codec.content_type()),
        );

        self.message
            .inner
            .transport
            .publish(Route::Direct(reply_to.clone()), env)
            .await?;

        log_debug!("replied to {reply_to} for {correlation_id}");
        Ok(())
    }
}

impl std::fmt::Debug for RpcRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRequest")
            .field("event", &self.message.inner.event)
            .field("data", &self.message.inner.data)
            .field("correlation_id", &self.target.correlation_id)
            .field("reply_to", &self.target.reply_to)
            .finish()
    }
}
