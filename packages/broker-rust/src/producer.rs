//! Producers publish envelopes into one exchange or one queue.

use serde::Serialize;
use switchboard_core::{ExchangeDeclaration, Headers, MessageEnvelope, DEFAULT_EXCHANGE};
use tracing::{debug, info, warn};

use crate::broker::{PublishOutcome, QueueDeclaration};
use crate::channel::Channel;
use crate::error::{MessagingError, Result};
use crate::session::Session;

/// Publishes into one exchange over its own channel.
#[derive(Debug)]
pub struct Producer {
    exchange: ExchangeDeclaration,
    channel: Channel,
}

impl Producer {
    /// Opens a channel and declares `exchange`.
    ///
    /// # Errors
    ///
    /// Channel creation errors, or [`MessagingError::ExchangeConflict`].
    pub async fn new(session: &Session, exchange: ExchangeDeclaration) -> Result<Self> {
        let channel = session.channel().await?;
        if !exchange.is_default() {
            channel.declare_exchange(&exchange)?;
        }
        info!(exchange = %exchange.name, kind = %exchange.kind, "producer ready");
        Ok(Self { exchange, channel })
    }

    #[must_use]
    pub fn exchange(&self) -> &ExchangeDeclaration {
        &self.exchange
    }

    /// Hands `envelope` to the exchange.
    ///
    /// `Accepted` means the broker took it for routing, not that anyone
    /// consumed it. A full queue yields `NotAccepted` rather than an error.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Channel`] if the exchange no longer exists; the
    ///   producer's channel is closed.
    /// - [`MessagingError::Connection`] / [`MessagingError::SessionClosed`].
    pub fn publish(&self, envelope: MessageEnvelope) -> Result<PublishOutcome> {
        let routing_key = envelope.routing_key.clone();
        let outcome = self.channel.publish(&self.exchange.name, envelope)?;
        match &outcome {
            PublishOutcome::Accepted { routed_to } => {
                debug!(exchange = %self.exchange.name, %routing_key, routed_to, "published");
            }
            PublishOutcome::NotAccepted { reason } => {
                warn!(
                    exchange = %self.exchange.name,
                    %routing_key,
                    %reason,
                    "publish not accepted"
                );
            }
        }
        Ok(outcome)
    }

    /// Publishes `payload` as persistent JSON with `routing_key`.
    ///
    /// # Errors
    ///
    /// [`MessagingError::Encode`] if `payload` cannot be serialized, else as
    /// [`publish`](Self::publish).
    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        routing_key: &str,
    ) -> Result<PublishOutcome> {
        let envelope = MessageEnvelope::json(payload)
            .map_err(MessagingError::Encode)?
            .with_routing_key(routing_key);
        self.publish(envelope)
    }

    /// Publishes `payload` as persistent JSON carrying `headers`, for
    /// headers exchanges.
    ///
    /// # Errors
    ///
    /// As [`publish_json`](Self::publish_json).
    pub fn publish_with_headers<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        headers: Headers,
    ) -> Result<PublishOutcome> {
        let envelope = MessageEnvelope::json(payload)
            .map_err(MessagingError::Encode)?
            .with_headers(headers);
        self.publish(envelope)
    }

    /// Closes the producer's channel. Idempotent.
    pub fn close(&self) {
        self.channel.close();
    }
}

/// Publishes straight into one queue through the default exchange.
#[derive(Debug)]
pub struct QueueProducer {
    queue: QueueDeclaration,
    channel: Channel,
}

impl QueueProducer {
    /// Opens a channel and declares `queue`.
    ///
    /// # Errors
    ///
    /// Channel creation errors, or [`MessagingError::QueueConflict`].
    pub async fn new(session: &Session, queue: QueueDeclaration) -> Result<Self> {
        let channel = session.channel().await?;
        channel.declare_queue(&queue)?;
        info!(queue = %queue.name, "queue producer ready");
        Ok(Self { queue, channel })
    }

    #[must_use]
    pub fn queue(&self) -> &QueueDeclaration {
        &self.queue
    }

    /// # Errors
    ///
    /// As [`Producer::publish`].
    pub fn publish(&self, envelope: MessageEnvelope) -> Result<PublishOutcome> {
        let envelope = envelope.with_routing_key(self.queue.name.clone());
        self.channel.publish(DEFAULT_EXCHANGE, envelope)
    }

    /// # Errors
    ///
    /// As [`Producer::publish_json`].
    pub fn publish_json<T: Serialize + ?Sized>(&self, payload: &T) -> Result<PublishOutcome> {
        let envelope = MessageEnvelope::json(payload).map_err(MessagingError::Encode)?;
        self.publish(envelope)
    }

    pub fn close(&self) {
        self.channel.close();
    }
}
