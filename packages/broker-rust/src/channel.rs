//! Channels: the unit of work on a session.
//!
//! A channel belongs to exactly one producer or consumer loop. A failure on
//! it (publishing to a missing exchange, consuming a deleted queue) closes
//! that channel only; the session and its other channels carry on.

use std::sync::Arc;

use arc_swap::ArcSwap;
use switchboard_core::{Binding, BindingPattern, ExchangeDeclaration, MessageEnvelope};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::broker::{ChannelId, PublishOutcome, QueueDeclaration, QueueStats};
use crate::delivery::Delivery;
use crate::error::{MessagingError, Result};
use crate::session::{leave_open, SessionInner, SessionState};

pub(crate) struct ChannelShared {
    pub(crate) id: ChannelId,
    session: Arc<SessionInner>,
    state: ArcSwap<SessionState>,
    cancel: CancellationToken,
}

impl ChannelShared {
    /// # Errors
    ///
    /// Session errors take precedence: a closed session reports
    /// `SessionClosed`, a failed one `Connection`. A channel closed on
    /// request reports `SessionClosed`, one closed by the broker `Channel`.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if let Some(err) = self.session.closed_error() {
            return Err(err);
        }
        match &**self.state.load() {
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(MessagingError::SessionClosed),
            SessionState::Failed(reason) => Err(MessagingError::Channel(reason.clone())),
        }
    }

    /// Closes the channel on request. Idempotent.
    pub(crate) fn close(&self) {
        if leave_open(&self.state, SessionState::Closed) {
            self.cancel.cancel();
            let requeued = self.release();
            debug!(channel = self.id.0, requeued, "channel closed");
        }
    }

    /// Closes the channel because the broker refused an operation on it.
    fn fail(&self, reason: &str) {
        if leave_open(&self.state, SessionState::Failed(reason.to_string())) {
            self.cancel.cancel();
            let requeued = self.release();
            warn!(channel = self.id.0, reason, requeued, "channel closed by broker");
        }
    }

    fn release(&self) -> usize {
        self.session.channel_released();
        self.session
            .broker
            .close_channel(self.session.connection_id(), self.id)
    }

    pub(crate) fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.session
            .broker
            .ack(self.session.connection_id(), self.id, delivery_tag)
    }

    pub(crate) fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.session
            .broker
            .nack(self.session.connection_id(), self.id, delivery_tag, requeue)
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        self.close();
    }
}

/// One logical channel over a [`Session`](crate::Session).
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("state", &**self.shared.state.load())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(id: ChannelId, session: Arc<SessionInner>) -> Self {
        let cancel = session.cancel.child_token();
        Self {
            shared: Arc::new(ChannelShared {
                id,
                session,
                state: ArcSwap::from_pointee(SessionState::Open),
                cancel,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.ensure_open().is_ok()
    }

    /// Why the channel is unusable, or `Ok` if it is open.
    ///
    /// # Errors
    ///
    /// The error any further operation on this channel would return.
    pub fn status(&self) -> Result<()> {
        self.shared.ensure_open()
    }

    /// Resolves when the channel or its session leaves the open state.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shared.cancel.cancelled()
    }

    /// A handle that can close this channel from another task.
    #[must_use]
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// # Errors
    ///
    /// [`MessagingError::ExchangeConflict`] if the exchange exists with
    /// another kind or durability. The channel stays open.
    pub fn declare_exchange(&self, decl: &ExchangeDeclaration) -> Result<()> {
        self.shared.ensure_open()?;
        self.broker().declare_exchange(decl)
    }

    /// # Errors
    ///
    /// Refusing to delete the default exchange closes the channel.
    pub fn delete_exchange(&self, name: &str) -> Result<bool> {
        self.shared.ensure_open()?;
        self.broker()
            .delete_exchange(name)
            .map_err(|err| self.fail_with(err))
    }

    /// # Errors
    ///
    /// [`MessagingError::QueueConflict`] for an incompatible redeclaration.
    pub fn declare_queue(&self, decl: &QueueDeclaration) -> Result<QueueStats> {
        self.shared.ensure_open()?;
        self.broker().declare_queue(decl)
    }

    /// Deletes a queue. Returns how many ready messages were discarded.
    ///
    /// # Errors
    ///
    /// Fails only if the channel is not open.
    pub fn delete_queue(&self, name: &str) -> Result<usize> {
        self.shared.ensure_open()?;
        Ok(self.broker().delete_queue(name))
    }

    /// # Errors
    ///
    /// [`MessagingError::InvalidBinding`] or [`MessagingError::NotFound`].
    pub fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: BindingPattern,
    ) -> Result<bool> {
        self.shared.ensure_open()?;
        self.broker().bind(&Binding::new(queue, exchange, pattern))
    }

    /// # Errors
    ///
    /// [`MessagingError::NotFound`] if the exchange does not exist.
    pub fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: BindingPattern,
    ) -> Result<bool> {
        self.shared.ensure_open()?;
        self.broker().unbind(&Binding::new(queue, exchange, pattern))
    }

    /// # Errors
    ///
    /// [`MessagingError::NotFound`] if the queue does not exist.
    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.shared.ensure_open()?;
        self.broker().queue_stats(queue)
    }

    /// Publishes `envelope` to `exchange`.
    ///
    /// # Errors
    ///
    /// Publishing to an exchange that does not exist closes the channel and
    /// returns [`MessagingError::Channel`].
    pub fn publish(&self, exchange: &str, envelope: MessageEnvelope) -> Result<PublishOutcome> {
        self.shared.ensure_open()?;
        self.broker()
            .publish(self.connection_id(), self.shared.id, exchange, envelope)
            .map_err(|err| self.fail_with(err))
    }

    /// Polls `queue` once. `Ok(None)` if it is empty.
    ///
    /// # Errors
    ///
    /// A missing queue closes the channel and returns
    /// [`MessagingError::Channel`].
    pub fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.shared.ensure_open()?;
        let fetched = self
            .broker()
            .basic_get(self.connection_id(), self.shared.id, queue)
            .map_err(|err| self.fail_with(err))?;
        Ok(fetched.map(|f| Delivery::new(f, queue, Arc::clone(&self.shared))))
    }

    /// Registers this channel as a consumer of `queue`.
    ///
    /// # Errors
    ///
    /// A missing queue closes the channel and returns
    /// [`MessagingError::Channel`].
    pub fn consume(&self, queue: &str) -> Result<()> {
        self.shared.ensure_open()?;
        self.broker()
            .register_consumer(self.connection_id(), self.shared.id, queue)
            .map_err(|err| self.fail_with(err))
    }

    /// Waits for the next message on `queue`.
    ///
    /// # Errors
    ///
    /// Returns the channel's terminal error once it or its session closes:
    /// [`MessagingError::SessionClosed`] after a requested close,
    /// [`MessagingError::Connection`] after a connection failure, and
    /// [`MessagingError::Channel`] if the queue was deleted.
    pub async fn next_delivery(&self, queue: &str) -> Result<Delivery> {
        loop {
            let notify = self
                .broker()
                .queue_notify(queue)
                .map_err(|err| self.fail_with(err))?;
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before polling so a publish in between is not missed.
            notified.as_mut().enable();

            if let Some(delivery) = self.get(queue)? {
                return Ok(delivery);
            }

            tokio::select! {
                () = self.shared.cancel.cancelled() => {
                    self.shared.ensure_open()?;
                    return Err(MessagingError::SessionClosed);
                }
                () = &mut notified => {}
            }
        }
    }

    /// Closes the channel, requeueing its unacked deliveries. Idempotent.
    ///
    /// Afterwards operations fail with [`MessagingError::SessionClosed`].
    pub fn close(&self) {
        self.shared.close();
    }

    fn broker(&self) -> &crate::broker::Broker {
        &self.shared.session.broker
    }

    fn connection_id(&self) -> crate::broker::ConnectionId {
        self.shared.session.connection_id()
    }

    /// Maps a broker refusal to a channel error, closing the channel.
    /// Connection errors pass through untouched.
    fn fail_with(&self, err: MessagingError) -> MessagingError {
        match err {
            MessagingError::Connection(_) => err,
            MessagingError::NotFound { .. } | MessagingError::Channel(_) => {
                let reason = match &err {
                    MessagingError::NotFound { .. } => format!("NOT_FOUND - {err}"),
                    _ => err.to_string(),
                };
                self.shared.fail(&reason);
                MessagingError::Channel(reason)
            }
            other => other,
        }
    }
}

/// Closes a [`Channel`] from outside the task that owns it.
#[derive(Clone)]
pub struct ChannelCloser {
    shared: Arc<ChannelShared>,
}

impl ChannelCloser {
    pub fn close(&self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for ChannelCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCloser")
            .field("id", &self.shared.id)
            .finish()
    }
}
