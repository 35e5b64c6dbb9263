//! The wire unit routed by exchanges.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::header::{HeaderValue, Headers};

/// A message as published into an exchange.
///
/// The payload is schema-less bytes; decoding into an application type is
/// the consumer's concern. Once published an envelope is shared behind an
/// `Arc` between every queue it was routed to and is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Raw message body.
    pub payload: Bytes,
    /// Dot-separated routing key. May be empty.
    pub routing_key: String,
    /// Header map consulted by headers exchanges.
    pub headers: Headers,
    /// Requests the broker retain the message across a restart. Advisory.
    pub persistent: bool,
}

impl MessageEnvelope {
    /// Creates a non-persistent envelope with no routing key and no headers.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            routing_key: String::new(),
            headers: Headers::new(),
            persistent: false,
        }
    }

    /// Serializes `value` as JSON into a persistent envelope.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(payload).persistent(true))
    }

    /// Sets the routing key.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Adds or replaces a single header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole header map.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the persistence flag.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Size of the payload in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
