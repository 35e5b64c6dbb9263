//! Bindings attach queues to exchanges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::header_match::HeaderMatch;
use crate::topic::TopicPattern;

/// The matching rule a binding carries.
///
/// `Key` serves direct (exact key), topic (pattern) and fanout (ignored)
/// exchanges. `Headers` serves headers exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingPattern {
    Key(String),
    Headers(HeaderMatch),
}

impl BindingPattern {
    /// A routing-key binding.
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// The empty-key binding used for fanout exchanges.
    #[must_use]
    pub fn fanout() -> Self {
        Self::Key(String::new())
    }

    /// Parses this binding's key as a topic pattern. `None` for header rules.
    #[must_use]
    pub fn topic(&self) -> Option<TopicPattern> {
        match self {
            Self::Key(k) => Some(TopicPattern::new(k)),
            Self::Headers(_) => None,
        }
    }

    /// Short label used in errors and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Key(_) => "routing-key",
            Self::Headers(_) => "header-match",
        }
    }
}

impl From<HeaderMatch> for BindingPattern {
    fn from(value: HeaderMatch) -> Self {
        Self::Headers(value)
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, "key={k:?}"),
            Self::Headers(m) => {
                write!(f, "x-match={}", m.mode)?;
                for (k, v) in &m.required {
                    write!(f, " {k}={v}")?;
                }
                Ok(())
            }
        }
    }
}

/// A queue's declared interest in an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub pattern: BindingPattern,
}

impl Binding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: BindingPattern,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            pattern,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{headers, Headers};

    #[test]
    fn display_forms() {
        assert_eq!(BindingPattern::key("order.#").to_string(), "key=\"order.#\"");
        let rule = HeaderMatch::any(headers([("priority", "high")]));
        assert_eq!(
            BindingPattern::from(rule).to_string(),
            "x-match=any priority=high"
        );
    }

    #[test]
    fn topic_view_of_key_binding() {
        let p = BindingPattern::key("order.*.created");
        assert!(p.topic().unwrap().matches("order.asia.created"));
        assert!(BindingPattern::Headers(HeaderMatch::all(Headers::new()))
            .topic()
            .is_none());
    }

    #[test]
    fn fanout_binding_has_empty_key() {
        assert_eq!(BindingPattern::fanout(), BindingPattern::Key(String::new()));
        assert_eq!(BindingPattern::fanout().label(), "routing-key");
    }
}
