//! Payload codecs.
//!
//! A codec turns a structured value into bytes for the transport and back.
//! Brokers hold one codec for their lifetime; typed payloads are converted
//! to and from [`serde_json::Value`] at the broker surface, so any codec
//! only has to handle that value model.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

use crate::Result;

/// Stateless encode/decode pair.
pub trait Codec: Send + Sync {
    /// Encode a value into transport bytes.
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// Decode transport bytes into a value.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;

    /// MIME type recorded in outgoing envelope metadata.
    fn content_type(&self) -> &str;
}

/// Shared codec pointer.
pub type CodecPtr = Arc<dyn Codec>;

/// JSON text codec. The default for every broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn round_trip(value: Value) {
        // ---
        let codec = JsonCodec;
        let bytes = codec.encode(&value).expect("encode failed");
        let decoded = codec.decode(&bytes).expect("decode failed");
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_round_trip_representative_values() {
        // ---
        round_trip(json!(42));
        round_trip(json!("hello"));
        round_trip(json!(""));
        round_trip(json!(null));
        round_trip(json!({
            "order": { "id": 7, "lines": [ { "sku": "a-1", "qty": 2 } ] },
            "tags": ["x", "y"],
        }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // ---
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, crate::BrokerError::Serialization(_)));
    }
}
