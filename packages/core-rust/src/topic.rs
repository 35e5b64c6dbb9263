//! Topic pattern matching.
//!
//! Routing keys and binding patterns are dot-separated word sequences. In a
//! pattern, `*` matches exactly one word and `#` matches zero or more words.
//! Every other word matches literally and case-sensitively. Matching is
//! whole-pattern against whole-key.
//!
//! The empty string is the zero-word sequence, so the empty routing key is
//! matched by `#` and by the empty pattern, and by nothing else.

use std::fmt;

/// Separator between words in routing keys and patterns.
pub const WORD_SEPARATOR: char = '.';

/// One word of a parsed topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TopicWord {
    /// `*`
    Star,
    /// `#`
    Hash,
    Literal(String),
}

/// A parsed topic binding pattern such as `order.*.created` or `order.#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    words: Vec<TopicWord>,
}

impl TopicPattern {
    /// Parses a pattern. Parsing never fails: any string is a valid pattern.
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        let words = split_words(pattern)
            .into_iter()
            .map(|w| match w {
                "*" => TopicWord::Star,
                "#" => TopicWord::Hash,
                other => TopicWord::Literal(other.to_string()),
            })
            .collect();
        Self {
            raw: pattern.to_string(),
            words,
        }
    }

    /// The pattern as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains a `*` or `#` word.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.words
            .iter()
            .any(|w| matches!(w, TopicWord::Star | TopicWord::Hash))
    }

    /// Returns `true` if `routing_key` matches this pattern.
    ///
    /// Bottom-up table over (pattern index, key index): `table[j]` for row
    /// `i` holds whether `words[i..]` matches `key[j..]`. Runs in
    /// `O(pattern_words * key_words)` regardless of how many `#` words the
    /// pattern contains.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        if !self.is_wildcard() {
            return split_words(&self.raw) == split_words(routing_key);
        }

        let key = split_words(routing_key);
        let key_len = key.len();

        // Row for i == words.len(): only the exhausted key matches.
        let mut next = vec![false; key_len + 1];
        next[key_len] = true;

        for word in self.words.iter().rev() {
            let mut current = vec![false; key_len + 1];
            for j in (0..=key_len).rev() {
                current[j] = match word {
                    // Either consume nothing, or consume one word and stay on `#`.
                    TopicWord::Hash => next[j] || (j < key_len && current[j + 1]),
                    TopicWord::Star => j < key_len && next[j + 1],
                    TopicWord::Literal(lit) => j < key_len && key[j] == lit && next[j + 1],
                };
            }
            next = current;
        }

        next[0]
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for TopicPattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Splits a key or pattern into words. The empty string has zero words.
fn split_words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split(WORD_SEPARATOR).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn m(pattern: &str, key: &str) -> bool {
        TopicPattern::new(pattern).matches(key)
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(m("order.*.created", "order.europe.created"));
        assert!(!m("order.*.created", "order.europe.region.created"));
        assert!(!m("order.*.created", "order.created"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(m("order.#", "order.europe.created"));
        assert!(m("order.#", "order.america.shipped"));
        assert!(m("order.#", "order"));
        assert!(!m("order.#", "invoice.europe"));
        assert!(m("order.#.created", "order.created"));
        assert!(m("order.#.created", "order.europe.created"));
        assert!(m("order.#.created", "order.europe.region.created"));
        assert!(!m("order.#.created", "order.europe.shipped"));
    }

    #[test]
    fn lone_hash_matches_everything_including_empty_key() {
        assert!(m("#", ""));
        assert!(m("#", "a"));
        assert!(m("#", "a.b.c.d"));
    }

    #[test]
    fn literal_matching_is_whole_key_and_case_sensitive() {
        assert!(m("order.created", "order.created"));
        assert!(!m("order.created", "order.created.late"));
        assert!(!m("order", "order.created"));
        assert!(!m("Order.created", "order.created"));
    }

    #[test]
    fn empty_pattern_matches_only_empty_key() {
        assert!(m("", ""));
        assert!(!m("", "a"));
        assert!(!m("*", ""));
    }

    #[test]
    fn many_hashes_do_not_blow_up() {
        let pattern = std::iter::repeat("#").take(40).collect::<Vec<_>>().join(".");
        let pattern = format!("{pattern}.z");
        let key = std::iter::repeat("a").take(60).collect::<Vec<_>>().join(".");
        assert!(!m(&pattern, &key));
        assert!(m(&pattern, &format!("{key}.z")));
    }

    #[test]
    fn display_and_wildcard_flag() {
        let p = TopicPattern::from("order.*.created");
        assert_eq!(p.to_string(), "order.*.created");
        assert_eq!(p.as_str(), "order.*.created");
        assert!(p.is_wildcard());
        assert!(!TopicPattern::new("order.created").is_wildcard());
    }

    /// Straightforward exponential matcher used as an oracle.
    fn reference(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => {
                reference(rest, key) || (!key.is_empty() && reference(pattern, &key[1..]))
            }
            Some((&"*", rest)) => !key.is_empty() && reference(rest, &key[1..]),
            Some((lit, rest)) => key.first() == Some(lit) && reference(rest, &key[1..]),
        }
    }

    fn word() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("a".to_string()),
            Just("b".to_string()),
            Just("order".to_string()),
        ]
    }

    fn pattern_word() -> impl Strategy<Value = String> {
        prop_oneof![word(), Just("*".to_string()), Just("#".to_string())]
    }

    proptest! {
        #[test]
        fn agrees_with_reference_matcher(
            pattern in prop::collection::vec(pattern_word(), 0..6),
            key in prop::collection::vec(word(), 0..7),
        ) {
            let p: Vec<&str> = pattern.iter().map(String::as_str).collect();
            let k: Vec<&str> = key.iter().map(String::as_str).collect();
            prop_assert_eq!(m(&p.join("."), &k.join(".")), reference(&p, &k));
        }

        #[test]
        fn key_always_matches_itself_as_pattern(key in prop::collection::vec(word(), 1..6)) {
            let key = key.join(".");
            prop_assert!(m(&key, &key));
        }

        #[test]
        fn starring_any_word_still_matches(
            key in prop::collection::vec(word(), 1..6),
            idx in any::<prop::sample::Index>(),
        ) {
            let mut pattern = key.clone();
            let i = idx.index(pattern.len());
            pattern[i] = "*".to_string();
            prop_assert!(m(&pattern.join("."), &key.join(".")));
        }
    }
}
