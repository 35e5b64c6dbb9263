//! Error taxonomy for sessions, channels, producers, and consumers.

use switchboard_core::{ExchangeDeclaration, RoutingError};
use thiserror::Error;

use crate::decode::DecodeError;

/// Result alias used throughout the broker package.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors surfaced by the messaging layer.
///
/// Connection errors are fatal to a session and every channel built on it.
/// Channel errors are fatal to one producer or consumer only. Decode and
/// handler failures never appear here from a running consumer: they are
/// contained to one delivery by a nack.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The connection failed or was dropped. Not retried internally.
    #[error("connection error: {0}")]
    Connection(String),

    /// A channel was closed by the broker.
    #[error("channel error: {0}")]
    Channel(String),

    /// An operation that needs a channel ran before `connect()`.
    #[error("channel not ready, call connect() first")]
    ChannelNotReady,

    /// An exchange was redeclared with a different kind or durability.
    #[error("exchange {exchange:?} is declared as {existing}, cannot redeclare as {requested}")]
    ExchangeConflict {
        exchange: String,
        existing: String,
        requested: String,
    },

    /// A queue was redeclared with different properties.
    #[error("queue {queue:?} is already declared with different properties")]
    QueueConflict { queue: String },

    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    /// Transient publish failure, safe to retry.
    #[error("publish failed: {0}")]
    Publish(String),

    /// An outgoing payload could not be serialized.
    #[error("payload could not be serialized: {0}")]
    Encode(#[source] serde_json::Error),

    /// Poison message: the payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Operation attempted after an explicit close.
    #[error("session closed")]
    SessionClosed,

    /// A delivery was acked or nacked a second time.
    #[error("delivery {delivery_tag} already settled")]
    AlreadySettled { delivery_tag: u64 },
}

impl MessagingError {
    pub(crate) fn exchange_conflict(
        existing: &ExchangeDeclaration,
        requested: &ExchangeDeclaration,
    ) -> Self {
        Self::ExchangeConflict {
            exchange: requested.name.clone(),
            existing: describe(existing),
            requested: describe(requested),
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Publish(_))
    }

    /// Whether the error means the whole session is unusable.
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::SessionClosed)
    }
}

impl From<RoutingError> for MessagingError {
    fn from(err: RoutingError) -> Self {
        Self::InvalidBinding(err.to_string())
    }
}

fn describe(decl: &ExchangeDeclaration) -> String {
    let durability = if decl.durable { "durable" } else { "transient" };
    format!("{durability} {}", decl.kind)
}

#[cfg(test)]
mod tests {
    use switchboard_core::ExchangeKind;

    use super::*;

    #[test]
    fn conflict_message_names_both_kinds() {
        let existing = ExchangeDeclaration::durable("orders", ExchangeKind::Direct);
        let requested = ExchangeDeclaration::durable("orders", ExchangeKind::Topic);
        let err = MessagingError::exchange_conflict(&existing, &requested);
        assert_eq!(
            err.to_string(),
            "exchange \"orders\" is declared as durable direct, cannot redeclare as durable topic"
        );
    }

    #[test]
    fn classification() {
        assert!(MessagingError::Publish("busy".into()).is_retryable());
        assert!(!MessagingError::Channel("gone".into()).is_retryable());
        assert!(MessagingError::Connection("reset".into()).is_fatal_to_session());
        assert!(MessagingError::SessionClosed.is_fatal_to_session());
        assert!(!MessagingError::ChannelNotReady.is_fatal_to_session());
    }

    #[test]
    fn routing_errors_become_invalid_binding() {
        let err: MessagingError = RoutingError::InvalidMatchMode("most".into()).into();
        assert!(matches!(err, MessagingError::InvalidBinding(_)));
    }
}
