//! Deliveries: one dequeued envelope awaiting settlement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use switchboard_core::MessageEnvelope;

use crate::broker::Fetched;
use crate::channel::ChannelShared;
use crate::error::{MessagingError, Result};

/// A message handed to a consumer.
///
/// Exactly one of [`ack`](Self::ack), [`nack`](Self::nack) or
/// [`reject`](Self::reject) succeeds; any later call returns
/// [`MessagingError::AlreadySettled`]. A delivery that is never settled is
/// redelivered once its channel closes.
pub struct Delivery {
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    queue: String,
    envelope: Arc<MessageEnvelope>,
    settled: AtomicBool,
    channel: Arc<ChannelShared>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_key", &self.envelope.routing_key)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub(crate) fn new(fetched: Fetched, queue: &str, channel: Arc<ChannelShared>) -> Self {
        Self {
            delivery_tag: fetched.delivery_tag,
            redelivered: fetched.redelivered,
            exchange: fetched.exchange,
            queue: queue.to_string(),
            envelope: fetched.envelope,
            settled: AtomicBool::new(false),
            channel,
        }
    }

    #[must_use]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether this message was delivered before and returned.
    #[must_use]
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Confirms the message was processed.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::SessionClosed`] once the channel or session was
    ///   closed; the broker has already requeued the message.
    /// - [`MessagingError::AlreadySettled`] on a second settlement.
    pub fn ack(&self) -> Result<()> {
        self.settle(|ch| ch.ack(self.delivery_tag))
    }

    /// Returns the message to its queue for redelivery.
    ///
    /// # Errors
    ///
    /// Same as [`ack`](Self::ack).
    pub fn nack(&self) -> Result<()> {
        self.settle(|ch| ch.nack(self.delivery_tag, true))
    }

    /// Drops the message without requeueing it.
    ///
    /// # Errors
    ///
    /// Same as [`ack`](Self::ack).
    pub fn reject(&self) -> Result<()> {
        self.settle(|ch| ch.nack(self.delivery_tag, false))
    }

    fn settle(&self, op: impl FnOnce(&ChannelShared) -> Result<()>) -> Result<()> {
        self.channel.ensure_open()?;
        if self
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MessagingError::AlreadySettled {
                delivery_tag: self.delivery_tag,
            });
        }
        if let Err(err) = op(self.channel.as_ref()) {
            self.settled.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }
}
