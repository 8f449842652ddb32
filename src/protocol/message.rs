//! Inbound message and typed data event.

// ============================================================================
// Imports
// ============================================================================

use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::SocketId;

// ============================================================================
// MessageEvent
// ============================================================================

/// A parsed inbound message as seen by subscription handlers.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Connection the message arrived on.
    pub connection_id: SocketId,

    /// Parsed message.
    pub data: Value,

    /// Raw text, present when original data output is enabled.
    pub original_data: Option<String>,

    /// Time the message was received.
    pub received_at: SystemTime,
}

impl MessageEvent {
    /// Creates a message event stamped with the current time.
    #[inline]
    #[must_use]
    pub fn new(connection_id: SocketId, data: Value, original_data: Option<String>) -> Self {
        Self {
            connection_id,
            data,
            original_data,
            received_at: SystemTime::now(),
        }
    }

    /// Deserializes the message into a typed [`DataEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if the message does not match `T`.
    pub fn to_data_event<T: DeserializeOwned>(&self, topic: Option<String>) -> Result<DataEvent<T>> {
        let data = T::deserialize(&self.data)?;
        Ok(DataEvent {
            data,
            topic,
            original_data: self.original_data.clone(),
            timestamp: self.received_at,
        })
    }
}

// ============================================================================
// DataEvent
// ============================================================================

/// Typed update delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent<T> {
    /// Deserialized payload.
    pub data: T,

    /// Topic the binding derived from the message, if any.
    pub topic: Option<String>,

    /// Raw text, present when original data output is enabled.
    pub original_data: Option<String>,

    /// Time the message was received.
    pub timestamp: SystemTime,
}

impl<T> DataEvent<T> {
    /// Transforms the payload while keeping the metadata.
    #[inline]
    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DataEvent<U> {
        DataEvent {
            data: f(self.data),
            topic: self.topic,
            original_data: self.original_data,
            timestamp: self.timestamp,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Trade {
        price: f64,
        size: f64,
    }

    #[test]
    fn test_to_data_event() {
        let event = MessageEvent::new(
            SocketId::new(1),
            json!({ "price": 10.5, "size": 2.0 }),
            Some("raw".into()),
        );

        let data: DataEvent<Trade> = event
            .to_data_event(Some("trades".into()))
            .expect("deserialize trade");

        assert_eq!(data.data, Trade { price: 10.5, size: 2.0 });
        assert_eq!(data.topic.as_deref(), Some("trades"));
        assert_eq!(data.original_data.as_deref(), Some("raw"));
        assert_eq!(data.timestamp, event.received_at);
    }

    #[test]
    fn test_to_data_event_type_mismatch() {
        let event = MessageEvent::new(SocketId::new(1), json!({ "price": "x" }), None);
        assert!(event.to_data_event::<Trade>(None).is_err());
    }

    #[test]
    fn test_map_keeps_metadata() {
        let event = MessageEvent::new(SocketId::new(2), json!(4), None);
        let data: DataEvent<u32> = event.to_data_event(Some("n".into())).expect("u32");
        let doubled = data.map(|n| n * 2);
        assert_eq!(doubled.data, 8);
        assert_eq!(doubled.topic.as_deref(), Some("n"));
    }
}
