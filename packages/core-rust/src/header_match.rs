//! Header-match rules for headers exchanges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RoutingError;
use crate::header::{HeaderValue, Headers};

/// Reserved binding argument selecting the match mode.
pub const X_MATCH: &str = "x-match";

/// How the required headers of a binding are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every required header must be present with an equal value.
    #[default]
    All,
    /// At least one required header must be present with an equal value.
    Any,
}

impl MatchMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMode {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => Err(RoutingError::InvalidMatchMode(other.to_string())),
        }
    }
}

/// A headers-exchange binding rule: a match mode plus required header pairs.
///
/// The reserved `x-match` key is never part of `required`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub mode: MatchMode,
    pub required: Headers,
}

impl HeaderMatch {
    #[must_use]
    pub fn all(required: Headers) -> Self {
        Self {
            mode: MatchMode::All,
            required,
        }
    }

    #[must_use]
    pub fn any(required: Headers) -> Self {
        Self {
            mode: MatchMode::Any,
            required,
        }
    }

    /// Builds a rule from AMQP-style binding arguments, where `x-match`
    /// sits alongside the required headers. A missing `x-match` means `all`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidMatchMode`] if `x-match` is present but
    /// is not the string `all` or `any`.
    pub fn from_arguments(mut arguments: Headers) -> Result<Self, RoutingError> {
        let mode = match arguments.remove(X_MATCH) {
            None => MatchMode::All,
            Some(HeaderValue::String(s)) => s.parse()?,
            Some(other) => return Err(RoutingError::InvalidMatchMode(other.to_string())),
        };
        Ok(Self {
            mode,
            required: arguments,
        })
    }

    /// Returns the binding arguments form, with `x-match` included.
    #[must_use]
    pub fn to_arguments(&self) -> Headers {
        let mut args = self.required.clone();
        args.insert(X_MATCH.to_string(), HeaderValue::from(self.mode.as_str()));
        args
    }

    /// Evaluates this rule against an envelope's headers.
    ///
    /// An empty required set matches everything under `all` and nothing
    /// under `any`.
    #[must_use]
    pub fn matches(&self, headers: &Headers) -> bool {
        let mut pairs = self
            .required
            .iter()
            .filter(|(key, _)| key.as_str() != X_MATCH);
        let present = |(key, value): (&String, &HeaderValue)| headers.get(key) == Some(value);
        match self.mode {
            MatchMode::All => pairs.all(present),
            MatchMode::Any => pairs.any(present),
        }
    }
}
