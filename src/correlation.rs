use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Token matching an RPC response to the call that produced its request.
///
/// Generated from a random 128-bit UUID, so collisions among concurrently
/// pending calls are negligible. Travels in envelope metadata and is
/// opaque to transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a new random correlation ID.
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shared form used in envelope metadata.
    pub fn to_arc(&self) -> Arc<str> {
        self.0.clone()
    }
}

impl From<Arc<str>> for CorrelationId {
    fn from(value: Arc<str>) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_unique() {
        // ---
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_format() {
        // ---
        let id = CorrelationId::generate();
        assert_eq!(id.to_string().len(), 36); // hyphenated UUID
        assert_eq!(id.as_str(), id.to_arc().as_ref());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        // ---
        let id = CorrelationId::from("abc-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc-123\"");

        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
