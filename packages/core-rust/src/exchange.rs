//! Exchange kinds and their routing algorithms.
//!
//! The set of kinds is closed, so the kind is a plain enum and each kind
//! selects a [`BindingTable`] variant when the exchange is declared:
//!
//! - **Direct**: hash index from routing key to queues.
//! - **Fanout**: flat queue set, routing key ignored.
//! - **Topic**: list of parsed patterns, each evaluated independently.
//! - **Headers**: list of header rules, each evaluated independently.
//!
//! Every matching binding receives the envelope; there is no
//! "most specific wins" shortcut.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::binding::{Binding, BindingPattern};
use crate::envelope::MessageEnvelope;
use crate::error::RoutingError;
use crate::header_match::HeaderMatch;
use crate::topic::TopicPattern;

/// Name of the nameless default exchange every queue is bound to.
pub const DEFAULT_EXCHANGE: &str = "";

/// Set of queue names selected by a routing decision, in name order.
pub type RouteSet = BTreeSet<String>;

/// The routing algorithm of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    /// AMQP type name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }

    /// Per-binding predicate for this kind.
    ///
    /// Used when routing over an arbitrary binding slice; the indexed
    /// [`BindingTable`] gives the same answers.
    #[must_use]
    pub fn binding_matches(self, pattern: &BindingPattern, envelope: &MessageEnvelope) -> bool {
        match (self, pattern) {
            (Self::Fanout, _) => true,
            (Self::Direct, BindingPattern::Key(key)) => *key == envelope.routing_key,
            (Self::Topic, BindingPattern::Key(key)) => {
                TopicPattern::new(key).matches(&envelope.routing_key)
            }
            (Self::Headers, BindingPattern::Headers(rule)) => rule.matches(&envelope.headers),
            _ => false,
        }
    }

    /// Evaluates `envelope` against every binding in `bindings` and returns
    /// the queues whose binding matches.
    #[must_use]
    pub fn route<'a, I>(self, envelope: &MessageEnvelope, bindings: I) -> RouteSet
    where
        I: IntoIterator<Item = &'a Binding>,
    {
        bindings
            .into_iter()
            .filter(|b| self.binding_matches(&b.pattern, envelope))
            .map(|b| b.queue.clone())
            .collect()
    }

    /// Checks that `pattern` can be attached to an exchange of this kind.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::PatternMismatch`] for a header rule on a
    /// key-based exchange or a routing key on a headers exchange.
    pub fn accepts(self, pattern: &BindingPattern) -> Result<(), RoutingError> {
        match (self, pattern) {
            (Self::Headers, BindingPattern::Headers(_))
            | (Self::Direct | Self::Fanout | Self::Topic, BindingPattern::Key(_)) => Ok(()),
            _ => Err(RoutingError::PatternMismatch {
                kind: self,
                pattern: pattern.label(),
            }),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            other => Err(RoutingError::UnknownKind(other.to_string())),
        }
    }
}

/// Parameters of an exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    /// Survives a broker restart.
    pub durable: bool,
}

impl ExchangeDeclaration {
    /// A durable exchange, the way every producer and consumer declares it.
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }

    /// A transient exchange.
    pub fn transient(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
        }
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }
}

/// Kind-specific binding index of one exchange.
#[derive(Debug, Clone)]
pub enum BindingTable {
    Direct(HashMap<String, BTreeSet<String>>),
    Fanout(BTreeSet<String>),
    Topic(Vec<(TopicPattern, String)>),
    Headers(Vec<(HeaderMatch, String)>),
}

impl BindingTable {
    /// Creates the empty table for `kind`.
    #[must_use]
    pub fn new(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => Self::Direct(HashMap::new()),
            ExchangeKind::Fanout => Self::Fanout(BTreeSet::new()),
            ExchangeKind::Topic => Self::Topic(Vec::new()),
            ExchangeKind::Headers => Self::Headers(Vec::new()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ExchangeKind {
        match self {
            Self::Direct(_) => ExchangeKind::Direct,
            Self::Fanout(_) => ExchangeKind::Fanout,
            Self::Topic(_) => ExchangeKind::Topic,
            Self::Headers(_) => ExchangeKind::Headers,
        }
    }

    /// Adds a binding of `queue` with `pattern`.
    ///
    /// Returns `Ok(false)` if an identical binding already existed.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::PatternMismatch`] if the pattern does not fit
    /// this table's exchange kind.
    pub fn bind(&mut self, queue: &str, pattern: &BindingPattern) -> Result<bool, RoutingError> {
        self.kind().accepts(pattern)?;
        let inserted = match (self, pattern) {
            (Self::Direct(index), BindingPattern::Key(key)) => index
                .entry(key.clone())
                .or_default()
                .insert(queue.to_string()),
            (Self::Fanout(queues), _) => queues.insert(queue.to_string()),
            (Self::Topic(entries), BindingPattern::Key(key)) => {
                let exists = entries.iter().any(|(p, q)| q == queue && p.as_str() == key);
                if !exists {
                    entries.push((TopicPattern::new(key), queue.to_string()));
                }
                !exists
            }
            (Self::Headers(entries), BindingPattern::Headers(rule)) => {
                let exists = entries.iter().any(|(r, q)| q == queue && r == rule);
                if !exists {
                    entries.push((rule.clone(), queue.to_string()));
                }
                !exists
            }
            _ => false,
        };
        Ok(inserted)
    }

    /// Removes one binding. Returns whether it existed.
    pub fn unbind(&mut self, queue: &str, pattern: &BindingPattern) -> bool {
        match (self, pattern) {
            (Self::Direct(index), BindingPattern::Key(key)) => {
                let Some(queues) = index.get_mut(key) else {
                    return false;
                };
                let removed = queues.remove(queue);
                if queues.is_empty() {
                    index.remove(key);
                }
                removed
            }
            (Self::Fanout(queues), _) => queues.remove(queue),
            (Self::Topic(entries), BindingPattern::Key(key)) => {
                let before = entries.len();
                entries.retain(|(p, q)| !(q == queue && p.as_str() == key));
                entries.len() != before
            }
            (Self::Headers(entries), BindingPattern::Headers(rule)) => {
                let before = entries.len();
                entries.retain(|(r, q)| !(q == queue && r == rule));
                entries.len() != before
            }
            _ => false,
        }
    }

    /// Removes every binding of `queue`. Returns how many were removed.
    pub fn remove_queue(&mut self, queue: &str) -> usize {
        match self {
            Self::Direct(index) => {
                let mut removed = 0;
                index.retain(|_, queues| {
                    if queues.remove(queue) {
                        removed += 1;
                    }
                    !queues.is_empty()
                });
                removed
            }
            Self::Fanout(queues) => usize::from(queues.remove(queue)),
            Self::Topic(entries) => {
                let before = entries.len();
                entries.retain(|(_, q)| q != queue);
                before - entries.len()
            }
            Self::Headers(entries) => {
                let before = entries.len();
                entries.retain(|(_, q)| q != queue);
                before - entries.len()
            }
        }
    }

    /// Selects the queues `envelope` must be delivered to.
    #[must_use]
    pub fn route(&self, envelope: &MessageEnvelope) -> RouteSet {
        match self {
            Self::Direct(index) => index
                .get(&envelope.routing_key)
                .cloned()
                .unwrap_or_default(),
            Self::Fanout(queues) => queues.clone(),
            Self::Topic(entries) => entries
                .iter()
                .filter(|(p, _)| p.matches(&envelope.routing_key))
                .map(|(_, q)| q.clone())
                .collect(),
            Self::Headers(entries) => entries
                .iter()
                .filter(|(r, _)| r.matches(&envelope.headers))
                .map(|(_, q)| q.clone())
                .collect(),
        }
    }

    /// Lists the bindings held by this table as `(queue, pattern)` pairs.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, BindingPattern)> {
        match self {
            Self::Direct(index) => index
                .iter()
                .flat_map(|(key, queues)| {
                    queues
                        .iter()
                        .map(move |q| (q.clone(), BindingPattern::Key(key.clone())))
                })
                .collect(),
            Self::Fanout(queues) => queues
                .iter()
                .map(|q| (q.clone(), BindingPattern::fanout()))
                .collect(),
            Self::Topic(entries) => entries
                .iter()
                .map(|(p, q)| (q.clone(), BindingPattern::Key(p.as_str().to_string())))
                .collect(),
            Self::Headers(entries) => entries
                .iter()
                .map(|(r, q)| (q.clone(), BindingPattern::Headers(r.clone())))
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Direct(index) => index.values().map(BTreeSet::len).sum(),
            Self::Fanout(queues) => queues.len(),
            Self::Topic(entries) => entries.len(),
            Self::Headers(entries) => entries.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A declared exchange together with its bindings.
#[derive(Debug, Clone)]
pub struct Exchange {
    declaration: ExchangeDeclaration,
    table: BindingTable,
}

impl Exchange {
    #[must_use]
    pub fn new(declaration: ExchangeDeclaration) -> Self {
        let table = BindingTable::new(declaration.kind);
        Self { declaration, table }
    }

    #[must_use]
    pub fn declaration(&self) -> &ExchangeDeclaration {
        &self.declaration
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    #[must_use]
    pub fn kind(&self) -> ExchangeKind {
        self.declaration.kind
    }

    /// Whether a redeclaration with `other` is compatible with this exchange.
    #[must_use]
    pub fn is_equivalent(&self, other: &ExchangeDeclaration) -> bool {
        self.declaration.kind == other.kind && self.declaration.durable == other.durable
    }

    /// See [`BindingTable::bind`].
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::PatternMismatch`] for an incompatible pattern.
    pub fn bind(&mut self, queue: &str, pattern: &BindingPattern) -> Result<bool, RoutingError> {
        self.table.bind(queue, pattern)
    }

    pub fn unbind(&mut self, queue: &str, pattern: &BindingPattern) -> bool {
        self.table.unbind(queue, pattern)
    }

    pub fn remove_queue(&mut self, queue: &str) -> usize {
        self.table.remove_queue(queue)
    }

    #[must_use]
    pub fn route(&self, envelope: &MessageEnvelope) -> RouteSet {
        self.table.route(envelope)
    }

    /// All bindings of this exchange.
    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        self.table
            .entries()
            .into_iter()
            .map(|(queue, pattern)| Binding::new(queue, self.declaration.name.clone(), pattern))
            .collect()
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::headers;

    fn exchange(kind: ExchangeKind) -> Exchange {
        Exchange::new(ExchangeDeclaration::durable("ex", kind))
    }

    fn keyed(key: &str) -> MessageEnvelope {
        MessageEnvelope::new("{}").with_routing_key(key)
    }

    fn set(names: &[&str]) -> RouteSet {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn direct_routes_on_exact_key_only() {
        let mut ex = exchange(ExchangeKind::Direct);
        ex.bind("order-created-queue", &BindingPattern::key("order.created")).unwrap();
        ex.bind("order-cancelled-queue", &BindingPattern::key("order.cancelled")).unwrap();

        assert_eq!(ex.route(&keyed("order.cancelled")), set(&["order-cancelled-queue"]));
        assert_eq!(ex.route(&keyed("order.created")), set(&["order-created-queue"]));
        assert!(ex.route(&keyed("order.shipped")).is_empty());
        assert!(ex.route(&keyed("order.*")).is_empty());
    }

    #[test]
    fn fanout_ignores_routing_key() {
        let mut ex = exchange(ExchangeKind::Fanout);
        ex.bind("notification-queue-1", &BindingPattern::fanout()).unwrap();
        ex.bind("notification-queue-2", &BindingPattern::key("ignored")).unwrap();

        assert_eq!(
            ex.route(&keyed("anything.at.all")),
            set(&["notification-queue-1", "notification-queue-2"])
        );
    }

    #[test]
    fn topic_delivers_to_every_matching_binding() {
        let mut ex = exchange(ExchangeKind::Topic);
        ex.bind("created-orders-queue", &BindingPattern::key("order.*.created")).unwrap();
        ex.bind("shipped-orders-queue", &BindingPattern::key("order.*.shipped")).unwrap();
        ex.bind("all-orders-queue", &BindingPattern::key("order.#")).unwrap();

        assert_eq!(
            ex.route(&keyed("order.europe.created")),
            set(&["all-orders-queue", "created-orders-queue"])
        );
        assert_eq!(
            ex.route(&keyed("order.america.shipped")),
            set(&["all-orders-queue", "shipped-orders-queue"])
        );
    }

    #[test]
    fn queue_with_two_matching_bindings_gets_one_copy() {
        let mut ex = exchange(ExchangeKind::Topic);
        ex.bind("q", &BindingPattern::key("order.#")).unwrap();
        ex.bind("q", &BindingPattern::key("order.*.created")).unwrap();
        assert_eq!(ex.route(&keyed("order.asia.created")), set(&["q"]));
        assert_eq!(ex.binding_count(), 2);
    }

    #[test]
    fn headers_routes_by_rule() {
        let mut ex = exchange(ExchangeKind::Headers);
        let rule = HeaderMatch::from_arguments(headers([
            ("x-match", "all"),
            ("priority", "high"),
            ("source", "payment-service"),
        ]))
        .unwrap();
        ex.bind("log-queue", &rule.into()).unwrap();

        let hit = MessageEnvelope::new("{}").with_headers(headers([
            ("priority", "high"),
            ("source", "payment-service"),
        ]));
        let miss = MessageEnvelope::new("{}").with_header("priority", "high");
        assert_eq!(ex.route(&hit), set(&["log-queue"]));
        assert!(ex.route(&miss).is_empty());
    }

    #[test]
    fn duplicate_binding_is_a_no_op() {
        let mut ex = exchange(ExchangeKind::Direct);
        assert!(ex.bind("q", &BindingPattern::key("k")).unwrap());
        assert!(!ex.bind("q", &BindingPattern::key("k")).unwrap());
        assert_eq!(ex.binding_count(), 1);
    }

    #[test]
    fn pattern_must_fit_kind() {
        let mut headers_ex = exchange(ExchangeKind::Headers);
        let err = headers_ex.bind("q", &BindingPattern::key("k")).unwrap_err();
        assert_eq!(
            err,
            RoutingError::PatternMismatch {
                kind: ExchangeKind::Headers,
                pattern: "routing-key",
            }
        );

        let mut topic_ex = exchange(ExchangeKind::Topic);
        let rule = BindingPattern::Headers(HeaderMatch::all(headers([("a", "b")])));
        assert!(topic_ex.bind("q", &rule).is_err());
    }

    #[test]
    fn unbind_and_remove_queue() {
        let mut ex = exchange(ExchangeKind::Direct);
        ex.bind("q1", &BindingPattern::key("a")).unwrap();
        ex.bind("q1", &BindingPattern::key("b")).unwrap();
        ex.bind("q2", &BindingPattern::key("a")).unwrap();

        assert!(ex.unbind("q2", &BindingPattern::key("a")));
        assert!(!ex.unbind("q2", &BindingPattern::key("a")));
        assert_eq!(ex.route(&keyed("a")), set(&["q1"]));

        assert_eq!(ex.remove_queue("q1"), 2);
        assert!(ex.route(&keyed("a")).is_empty());
        assert_eq!(ex.binding_count(), 0);
    }

    #[test]
    fn slice_routing_agrees_with_table() {
        let mut ex = exchange(ExchangeKind::Topic);
        for (q, p) in [("a", "order.#"), ("b", "order.*.created"), ("c", "#.shipped")] {
            ex.bind(q, &BindingPattern::key(p)).unwrap();
        }
        let bindings = ex.bindings();
        for key in ["order.eu.created", "order.us.shipped", "invoice.shipped", ""] {
            let env = keyed(key);
            assert_eq!(ExchangeKind::Topic.route(&env, &bindings), ex.route(&env));
        }
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            ExchangeKind::Direct,
            ExchangeKind::Fanout,
            ExchangeKind::Topic,
            ExchangeKind::Headers,
        ] {
            assert_eq!(kind.as_str().parse::<ExchangeKind>().unwrap(), kind);
        }
        assert!("x-delayed".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn equivalence_checks_kind_and_durability() {
        let ex = exchange(ExchangeKind::Direct);
        assert!(ex.is_equivalent(&ExchangeDeclaration::durable("ex", ExchangeKind::Direct)));
        assert!(!ex.is_equivalent(&ExchangeDeclaration::durable("ex", ExchangeKind::Topic)));
        assert!(!ex.is_equivalent(&ExchangeDeclaration::transient("ex", ExchangeKind::Direct)));
    }
}
