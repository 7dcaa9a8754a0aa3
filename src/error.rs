use std::time::Duration;
use thiserror::Error;

/// Errors produced by brokers, transports, and codecs.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Provisioning, binding, publishing, consuming, or acknowledging failed
    /// in the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// An RPC call did not receive a response within its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// A listener failed while handling a message.
    ///
    /// Reported on the broker's error channel, never returned to a caller.
    #[error("listener for event '{event}' failed: {message}")]
    Handler { event: String, message: String },

    /// Payload encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required configuration field was not provided.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// A configuration value was provided but is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A group or event name cannot be mapped to a destination.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A reply was attempted on a request that carried no reply destination
    /// or correlation token.
    #[error("request carries no reply destination or correlation token")]
    MissingReplyTo,

    /// The broker was destroyed before the operation could complete.
    #[error("broker destroyed")]
    Destroyed,
}

impl BrokerError {
    /// Convenience constructor for listener failures.
    pub fn handler(event: impl Into<String>, message: impl std::fmt::Display) -> Self {
        // ---
        BrokerError::Handler {
            event: event.into(),
            message: message.to_string(),
        }
    }

    /// True for errors raised by the transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
