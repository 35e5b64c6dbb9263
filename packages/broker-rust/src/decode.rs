//! Payload decoding for consumers.
//!
//! A consumer is generic over the message type its handler receives. The
//! type says how to get itself out of an envelope via [`Decode`]; a failure
//! is a poison message and is nacked by the consumption loop.

use std::ops::Deref;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use switchboard_core::MessageEnvelope;
use thiserror::Error;

/// Why a payload could not be turned into the handler's message type.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON for the expected type: {0}")]
    Json(#[from] serde_json::Error),
}

/// Conversion from a delivered envelope into a handler's message type.
pub trait Decode: Sized + Send + 'static {
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the envelope content is malformed.
    fn decode(envelope: &MessageEnvelope) -> Result<Self, DecodeError>;
}

/// Raw payload bytes. Never fails.
impl Decode for Bytes {
    fn decode(envelope: &MessageEnvelope) -> Result<Self, DecodeError> {
        Ok(envelope.payload.clone())
    }
}

impl Decode for String {
    fn decode(envelope: &MessageEnvelope) -> Result<Self, DecodeError> {
        Ok(std::str::from_utf8(&envelope.payload)?.to_string())
    }
}

/// Untyped JSON document.
impl Decode for serde_json::Value {
    fn decode(envelope: &MessageEnvelope) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(&envelope.payload)?)
    }
}

/// The whole envelope, for handlers that need headers or the routing key.
impl Decode for MessageEnvelope {
    fn decode(envelope: &MessageEnvelope) -> Result<Self, DecodeError> {
        Ok(envelope.clone())
    }
}

/// A JSON payload deserialized into `T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: DeserializeOwned + Send + 'static> Decode for Json<T> {
    fn decode(envelope: &MessageEnvelope) -> Result<Self, DecodeError> {
        Ok(Self(serde_json::from_slice(&envelope.payload)?))
    }
}
