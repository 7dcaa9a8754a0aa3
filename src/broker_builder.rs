//! Broker builder.
//!
//! Provides a fluent builder API for configuring pub/sub and RPC brokers.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    // ---
    DEFAULT_CALL_TIMEOUT,
    DEFAULT_ERROR_CAPACITY,
    DEFAULT_PUBSUB_EXCHANGE,
    DEFAULT_RPC_EXCHANGE,
};
use crate::{
    // ---
    BrokerConfig,
    BrokerError,
    CodecPtr,
    JsonCodec,
    PubSubBroker,
    Result,
    RpcBroker,
    TransportPtr,
};

#[derive(Debug, Clone)]
enum ExchangeChoice {
    /// Use the flavor's default exchange.
    Default,
    Named(String),
    /// Publish straight to destinations.
    Disabled,
}

/// Builder for broker instances.
///
/// The transport is required; everything else has a default.
///
/// # Examples
///
/// ## Pub/sub broker
/// ```no_run
/// use mom_broker::BrokerBuilder;
///
/// # async fn example() -> mom_broker::Result<()> {
/// let transport = mom_broker::create_memory_transport("orders-service").await?;
///
/// let broker = BrokerBuilder::new()
///     .transport(transport)
///     .exchange("shop.events")
///     .build_pubsub()?;
/// # Ok(())
/// # }
/// ```
///
/// ## RPC broker with a shorter deadline
/// ```no_run
/// use mom_broker::BrokerBuilder;
/// use std::time::Duration;
///
/// # async fn example() -> mom_broker::Result<()> {
/// let transport = mom_broker::create_memory_transport("pricing-client").await?;
///
/// let broker = BrokerBuilder::new()
///     .transport(transport)
///     .call_timeout(Duration::from_millis(750))
///     .build_rpc()?;
/// # Ok(())
/// # }
/// ```
pub struct BrokerBuilder {
    // ---
    transport: Option<TransportPtr>,
    codec: Option<CodecPtr>,
    exchange: ExchangeChoice,
    call_timeout: Option<Duration>,
    error_capacity: Option<usize>,
}

impl BrokerBuilder {
    /// Create a new, empty builder.
    pub fn new() -> Self {
        // ---
        Self {
            transport: None,
            codec: None,
            exchange: ExchangeChoice::Default,
            call_timeout: None,
            error_capacity: None,
        }
    }

    /// Set the transport (required).
    pub fn transport(mut self, transport: TransportPtr) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the payload codec.
    ///
    /// Default: [`JsonCodec`].
    pub fn codec(mut self, codec: CodecPtr) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Bind subscriptions to, and publish through, `exchange`.
    ///
    /// Default: `"mom.events"` for pub/sub, `"mom.rpc"` for RPC.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = ExchangeChoice::Named(exchange.into());
        self
    }

    /// Use no exchange: `publish`/`call` send straight to the destination
    /// named after the event, and subscribers consume that destination
    /// whatever their group.
    pub fn no_exchange(mut self) -> Self {
        self.exchange = ExchangeChoice::Disabled;
        self
    }

    /// Set the default RPC deadline.
    ///
    /// Default: 5000 ms.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set how many error reports each error-channel receiver buffers.
    ///
    /// Default: 64.
    pub fn error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = Some(capacity);
        self
    }

    /// Build a publish/subscribe broker (consumes self).
    ///
    /// # Errors
    ///
    /// See [`BrokerBuilder::build_config`].
    pub fn build_pubsub(self) -> Result<PubSubBroker> {
        let config = self.build_config(DEFAULT_PUBSUB_EXCHANGE)?;
        Ok(PubSubBroker::new(config))
    }

    /// Build a request/reply broker (consumes self).
    ///
    /// # Errors
    ///
    /// See [`BrokerBuilder::build_config`].
    pub fn build_rpc(self) -> Result<RpcBroker> {
        let config = self.build_config(DEFAULT_RPC_EXCHANGE)?;
        Ok(RpcBroker::new(config))
    }

    /// Validate the settings and produce the immutable configuration record.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no transport was set
    /// - the exchange name is empty
    /// - the call timeout is zero
    /// - the error capacity is zero
    pub fn build_config(self, default_exchange: &str) -> Result<BrokerConfig> {
        // ---
        let transport = self
            .transport
            .ok_or_else(|| BrokerError::MissingConfig("transport".into()))?;

        let exchange = match self.exchange {
            ExchangeChoice::Default => Some(Arc::from(default_exchange)),
            ExchangeChoice::Named(name) if name.is_empty() => {
                return Err(BrokerError::InvalidConfig(
                    "exchange name must not be empty; use no_exchange() instead".into(),
                ));
            }
            ExchangeChoice::Named(name) => Some(Arc::from(name)),
            ExchangeChoice::Disabled => None,
        };

        let call_timeout = self.call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        if call_timeout.is_zero() {
            return Err(BrokerError::InvalidConfig(
                "call timeout must be greater than zero".into(),
            ));
        }

        let error_capacity = self.error_capacity.unwrap_or(DEFAULT_ERROR_CAPACITY);
        if error_capacity == 0 {
            return Err(BrokerError::InvalidConfig(
                "error capacity must be greater than zero".into(),
            ));
        }

        Ok(BrokerConfig {
            transport,
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
            exchange,
            call_timeout,
            error_capacity,
        })
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_missing_transport_fails_fast() {
        // ---
        let err = BrokerBuilder::new()
            .build_config(DEFAULT_RPC_EXCHANGE)
            .unwrap_err();
        assert!(matches!(err, BrokerError::MissingConfig(ref f) if f == "transport"));
    }

    #[tokio::test]
    async fn test_defaults() {
        // ---
        let transport = crate::create_memory_transport("defaults").await.unwrap();
        let config = BrokerBuilder::new()
            .transport(transport)
            .build_config(DEFAULT_PUBSUB_EXCHANGE)
            .unwrap();

        assert_eq!(config.exchange(), Some(DEFAULT_PUBSUB_EXCHANGE));
        assert_eq!(config.call_timeout(), Duration::from_millis(5000));
        assert_eq!(config.codec().content_type(), "application/json");
        assert_eq!(config.error_capacity(), 64);
    }

    #[tokio::test]
    async fn test_invalid_values_rejected() {
        // ---
        let transport = crate::create_memory_transport("invalid").await.unwrap();

        let err = BrokerBuilder::new()
            .transport(transport.clone())
            .exchange("")
            .build_config(DEFAULT_RPC_EXCHANGE)
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));

        let err = BrokerBuilder::new()
            .transport(transport.clone())
            .call_timeout(Duration::ZERO)
            .build_config(DEFAULT_RPC_EXCHANGE)
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));

        let config = BrokerBuilder::new()
            .transport(transport)
            .no_exchange()
            .build_config(DEFAULT_RPC_EXCHANGE)
            .unwrap();
        assert_eq!(config.exchange(), None);
    }
}
