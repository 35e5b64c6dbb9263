//! Queues: FIFO mailboxes of routed envelopes.

use std::collections::VecDeque;
use std::sync::Arc;

use switchboard_core::MessageEnvelope;
use tokio::sync::Notify;

/// Parameters of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueDeclaration {
    pub name: String,
    /// Survives a broker restart.
    pub durable: bool,
    /// Ready-message capacity. Publishes that would exceed it are rejected.
    pub max_length: Option<usize>,
}

impl QueueDeclaration {
    /// A durable, unbounded queue, the way consumers declare their queues.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_length: None,
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            max_length: None,
        }
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Counters reported by a queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Messages ready for delivery.
    pub message_count: usize,
    /// Messages delivered and not yet settled.
    pub unacked_count: usize,
    /// Consumers currently attached.
    pub consumer_count: usize,
}

/// One envelope waiting in a queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Arc<MessageEnvelope>,
    /// Exchange it was published to.
    pub exchange: String,
    /// Set once the message has been delivered and returned.
    pub redelivered: bool,
    /// How many times the message has been handed to a consumer.
    pub delivery_count: u32,
}

impl QueuedMessage {
    pub(crate) fn new(envelope: Arc<MessageEnvelope>, exchange: &str) -> Self {
        Self {
            envelope,
            exchange: exchange.to_string(),
            redelivered: false,
            delivery_count: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) declaration: QueueDeclaration,
    /// Effective capacity after applying broker defaults.
    pub(crate) max_length: Option<usize>,
    pub(crate) messages: VecDeque<QueuedMessage>,
    pub(crate) consumers: usize,
    pub(crate) notify: Arc<Notify>,
}

impl Queue {
    pub(crate) fn new(declaration: QueueDeclaration, default_max_length: Option<usize>) -> Self {
        let max_length = declaration.max_length.or(default_max_length);
        Self {
            declaration,
            max_length,
            messages: VecDeque::new(),
            consumers: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.max_length
            .is_some_and(|max| self.messages.len() >= max)
    }

    pub(crate) fn push(&mut self, message: QueuedMessage) {
        self.messages.push_back(message);
        self.notify.notify_waiters();
    }

    /// Puts a returned message back at the head so it is delivered next.
    pub(crate) fn requeue(&mut self, mut message: QueuedMessage) {
        message.redelivered = true;
        self.messages.push_front(message);
        self.notify.notify_waiters();
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: &'static str) -> QueuedMessage {
        QueuedMessage::new(Arc::new(MessageEnvelope::new(body)), "ex")
    }

    #[test]
    fn fifo_order_with_requeue_at_head() {
        let mut q = Queue::new(QueueDeclaration::durable("q"), None);
        q.push(msg("a"));
        q.push(msg("b"));

        let first = q.pop().unwrap();
        assert_eq!(first.envelope.payload, "a");
        q.requeue(first);

        let again = q.pop().unwrap();
        assert_eq!(again.envelope.payload, "a");
        assert!(again.redelivered);
        assert_eq!(q.pop().unwrap().envelope.payload, "b");
        assert!(q.pop().is_none());
    }

    #[test]
    fn capacity_prefers_declared_limit() {
        let mut q = Queue::new(QueueDeclaration::durable("q").with_max_length(1), Some(10));
        assert!(!q.is_full());
        q.push(msg("a"));
        assert!(q.is_full());

        let q = Queue::new(QueueDeclaration::durable("q"), Some(0));
        assert!(q.is_full());

        let q = Queue::new(QueueDeclaration::durable("q"), None);
        assert!(!q.is_full());
    }
}
