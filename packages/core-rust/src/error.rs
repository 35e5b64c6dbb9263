use thiserror::Error;

use crate::exchange::ExchangeKind;

/// Errors raised by the pure routing model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// `x-match` was neither `all` nor `any`.
    #[error("invalid x-match value {0:?}, expected \"all\" or \"any\"")]
    InvalidMatchMode(String),

    /// A binding pattern does not fit the exchange kind it targets.
    #[error("{pattern} binding cannot be attached to a {kind} exchange")]
    PatternMismatch {
        kind: ExchangeKind,
        pattern: &'static str,
    },

    /// Unknown exchange type name.
    #[error("unknown exchange kind {0:?}")]
    UnknownKind(String),
}
