//! Switchboard Core: message envelopes, exchange kinds, bindings, and the
//! direct/fanout/topic/headers routing algorithms.

pub mod binding;
pub mod envelope;
pub mod error;
pub mod exchange;
pub mod header;
pub mod header_match;
pub mod topic;

pub use binding::{Binding, BindingPattern};
pub use envelope::MessageEnvelope;
pub use error::RoutingError;
pub use exchange::{
    BindingTable, Exchange, ExchangeDeclaration, ExchangeKind, RouteSet, DEFAULT_EXCHANGE,
};
pub use header::{HeaderValue, Headers};
pub use header_match::{HeaderMatch, MatchMode, X_MATCH};
pub use topic::TopicPattern;
