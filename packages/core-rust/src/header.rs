//! Scalar header values and the header map carried by every envelope.

use std::collections::BTreeMap;
use std::fmt;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Header map attached to a [`MessageEnvelope`](crate::MessageEnvelope).
///
/// Uses `BTreeMap` so that two maps built in different insertion orders
/// compare equal and serialize identically.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A scalar header value.
///
/// Equality is structural: `Int(1)` and `String("1")` are different values.
/// Floats are wrapped in `OrderedFloat` so the whole enum is `Eq + Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float with a total order.
    Float(OrderedFloat<f64>),
    /// UTF-8 string.
    String(String),
}

impl HeaderValue {
    /// Returns the string content if this is a `String` value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a JSON scalar into a header value.
    ///
    /// Returns `None` for `null`, arrays, objects, and numbers that fit
    /// neither `i64` nor `f64`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(|f| Self::Float(OrderedFloat(f)))),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        Self::Float(OrderedFloat(value))
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Builds a [`Headers`] map from `(key, value)` pairs.
///
/// ```
/// use switchboard_core::header::headers;
///
/// let h = headers([("priority", "high"), ("source", "payment-service")]);
/// assert_eq!(h.len(), 2);
/// ```
pub fn headers<K, V, I>(pairs: I) -> Headers
where
    K: Into<String>,
    V: Into<HeaderValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
