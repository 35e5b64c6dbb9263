//! Queue consumers.
//!
//! State machine: Unbound -> Bound -> Consuming -> Closed
//!
//! A [`Consumer`] declares its exchange and queue on [`connect`], attaches
//! bindings with [`bind_queue`], then runs one consumption loop on its own
//! channel. The loop takes one delivery at a time, decodes it into the
//! handler's message type, runs the handler, and acks on success. A handler
//! error or panic nacks the delivery with requeue. A payload that cannot be
//! decoded is rejected without requeue, since redelivering it cannot help.
//! The loop itself keeps going either way.
//!
//! [`connect`]: Consumer::connect
//! [`bind_queue`]: Consumer::bind_queue

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use switchboard_core::{BindingPattern, ExchangeDeclaration, ExchangeKind, DEFAULT_EXCHANGE};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::QueueDeclaration;
use crate::channel::{Channel, ChannelCloser};
use crate::decode::Decode;
use crate::error::{MessagingError, Result};
use crate::session::Session;

/// Processes one decoded message. An `Err` nacks the delivery.
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: M) -> anyhow::Result<()> {
        self(message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No binding yet. Also the state right after `connect`.
    Unbound,
    Bound,
    Consuming,
    /// Closed on request, or the loop ended because its channel or session
    /// went away. [`ConsumerHandle::join`] tells which.
    Closed,
}

/// Counters returned when a consumption loop ends cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeSummary {
    pub delivered: u64,
    pub acked: u64,
    /// Requeued after a handler error or panic.
    pub nacked: u64,
    /// Dropped without requeue because the payload could not be decoded.
    pub rejected: u64,
    pub decode_failures: u64,
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Ack,
    Requeue,
    Reject,
}

/// Subscribes one queue, bound to one exchange.
#[derive(Debug)]
pub struct Consumer {
    exchange: ExchangeDeclaration,
    queue: QueueDeclaration,
    state: ConsumerState,
    channel: Option<Arc<Channel>>,
}

impl Consumer {
    /// A consumer of `queue` on `exchange`. No I/O until [`connect`](Self::connect).
    #[must_use]
    pub fn new(exchange: ExchangeDeclaration, queue: QueueDeclaration) -> Self {
        Self {
            exchange,
            queue,
            state: ConsumerState::Unbound,
            channel: None,
        }
    }

    /// A consumer that reads `queue` directly, fed through the default
    /// exchange. Needs no binding.
    #[must_use]
    pub fn for_queue(queue: QueueDeclaration) -> Self {
        Self::new(
            ExchangeDeclaration::durable(DEFAULT_EXCHANGE, ExchangeKind::Direct),
            queue,
        )
    }

    /// Current state. A running loop whose channel or session has closed
    /// reports [`ConsumerState::Closed`].
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        match (&self.state, &self.channel) {
            (ConsumerState::Consuming, Some(channel)) if channel.status().is_err() => {
                ConsumerState::Closed
            }
            (state, _) => *state,
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &ExchangeDeclaration {
        &self.exchange
    }

    #[must_use]
    pub fn queue(&self) -> &QueueDeclaration {
        &self.queue
    }

    /// Opens the consumer's channel and declares its exchange and queue.
    /// Calling it again on a connected consumer does nothing.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::SessionClosed`] after [`close`](Self::close).
    /// - Channel creation errors from [`Session::channel`].
    /// - [`MessagingError::ExchangeConflict`] / [`MessagingError::QueueConflict`].
    pub async fn connect(&mut self, session: &Session) -> Result<()> {
        if self.state == ConsumerState::Closed {
            return Err(MessagingError::SessionClosed);
        }
        if self.channel.is_some() {
            return Ok(());
        }
        let channel = session.channel().await?;
        if !self.exchange.is_default() {
            channel.declare_exchange(&self.exchange)?;
        }
        channel.declare_queue(&self.queue)?;
        info!(
            exchange = %self.exchange.name,
            queue = %self.queue.name,
            channel = channel.id().0,
            "consumer connected"
        );
        self.channel = Some(Arc::new(channel));
        Ok(())
    }

    /// Binds the queue to the exchange with `pattern`. May be called again
    /// to add more bindings; duplicates are ignored.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::ChannelNotReady`] before [`connect`](Self::connect).
    /// - [`MessagingError::InvalidBinding`] if the pattern does not fit the
    ///   exchange kind, or the exchange is the default exchange.
    pub fn bind_queue(&mut self, pattern: impl Into<BindingPattern>) -> Result<()> {
        let channel = self.ready_channel()?;
        channel.bind_queue(&self.queue.name, &self.exchange.name, pattern.into())?;
        if self.state == ConsumerState::Unbound {
            self.state = ConsumerState::Bound;
        }
        Ok(())
    }

    /// Removes one binding. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// [`MessagingError::ChannelNotReady`] before [`connect`](Self::connect).
    pub fn unbind_queue(&mut self, pattern: impl Into<BindingPattern>) -> Result<bool> {
        let channel = self.ready_channel()?;
        channel.unbind_queue(&self.queue.name, &self.exchange.name, pattern.into())
    }

    /// Starts the consumption loop on a background task.
    ///
    /// The loop ends with `Ok` once the consumer or its session is closed,
    /// with [`MessagingError::Connection`] if the connection fails, and with
    /// [`MessagingError::Channel`] if the broker closes the channel (for
    /// instance because the queue was deleted).
    ///
    /// # Errors
    ///
    /// - [`MessagingError::ChannelNotReady`] before [`connect`](Self::connect).
    /// - [`MessagingError::Channel`] if the consumer is already consuming.
    /// - [`MessagingError::InvalidBinding`] if the queue has no binding to a
    ///   named exchange yet. Default-exchange consumers need none.
    pub fn start_consuming<M, H>(&mut self, handler: H) -> Result<ConsumerHandle>
    where
        M: Decode,
        H: MessageHandler<M>,
    {
        if self.state == ConsumerState::Consuming {
            return Err(MessagingError::Channel("consumer is already consuming".into()));
        }
        let channel = Arc::clone(self.ready_channel()?);
        if self.state == ConsumerState::Unbound && !self.exchange.is_default() {
            return Err(MessagingError::InvalidBinding(format!(
                "queue {} has no binding to exchange {}",
                self.queue.name, self.exchange.name
            )));
        }
        channel.consume(&self.queue.name)?;

        let span = info_span!(
            "consumer",
            exchange = %self.exchange.name,
            queue = %self.queue.name,
            channel = channel.id().0,
        );
        let closer = channel.closer();
        let queue = self.queue.name.clone();
        let consuming = consume_loop::<M, H>(channel, queue.clone(), handler);
        let join = tokio::spawn(consuming.instrument(span));

        self.state = ConsumerState::Consuming;
        Ok(ConsumerHandle {
            queue,
            join,
            closer,
        })
    }

    /// Stops the loop and closes the channel. Idempotent.
    ///
    /// Deliveries not yet settled are requeued by the broker; settling them
    /// afterwards fails with [`MessagingError::SessionClosed`].
    pub fn close(&mut self) {
        if self.state == ConsumerState::Closed {
            return;
        }
        self.state = ConsumerState::Closed;
        if let Some(channel) = &self.channel {
            channel.close();
        }
        info!(queue = %self.queue.name, "consumer closed");
    }

    fn ready_channel(&self) -> Result<&Arc<Channel>> {
        if self.state == ConsumerState::Closed {
            return Err(MessagingError::SessionClosed);
        }
        self.channel.as_ref().ok_or(MessagingError::ChannelNotReady)
    }
}

/// Handle to a running consumption loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    join: JoinHandle<Result<ConsumeSummary>>,
    closer: ChannelCloser,
}

impl ConsumerHandle {
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Asks the loop to stop. The in-flight handler, if any, is abandoned
    /// and its delivery requeued.
    pub fn stop(&self) {
        self.closer.close();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the loop to end and returns its outcome.
    ///
    /// # Errors
    ///
    /// The loop's terminal error; see [`Consumer::start_consuming`].
    pub async fn join(self) -> Result<ConsumeSummary> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(MessagingError::Channel(format!(
                "consumer task ended abnormally: {err}"
            ))),
        }
    }

    /// [`stop`](Self::stop) followed by [`join`](Self::join).
    ///
    /// # Errors
    ///
    /// See [`join`](Self::join).
    pub async fn shutdown(self) -> Result<ConsumeSummary> {
        self.stop();
        self.join().await
    }
}

async fn consume_loop<M, H>(
    channel: Arc<Channel>,
    queue: String,
    handler: H,
) -> Result<ConsumeSummary>
where
    M: Decode,
    H: MessageHandler<M>,
{
    let mut summary = ConsumeSummary::default();
    info!("consumer started");

    loop {
        let delivery = match channel.next_delivery(&queue).await {
            Ok(delivery) => delivery,
            Err(err) => return finish(summary, err),
        };
        summary.delivered += 1;
        let delivery_tag = delivery.delivery_tag();
        debug!(
            delivery_tag,
            redelivered = delivery.redelivered(),
            routing_key = %delivery.envelope().routing_key,
            "delivery received"
        );

        let verdict = match M::decode(delivery.envelope()) {
            Err(err) => {
                summary.decode_failures += 1;
                warn!(delivery_tag, error = %err, "payload could not be decoded, rejecting");
                Verdict::Reject
            }
            Ok(message) => {
                let handled = AssertUnwindSafe(handler.handle(message)).catch_unwind();
                tokio::select! {
                    biased;
                    () = channel.cancelled() => {
                        let err = channel
                            .status()
                            .err()
                            .unwrap_or(MessagingError::SessionClosed);
                        return finish(summary, err);
                    }
                    outcome = handled => match outcome {
                        Ok(Ok(())) => Verdict::Ack,
                        Ok(Err(err)) => {
                            let error = format!("{err:#}");
                            warn!(delivery_tag, %error, "handler failed, nacking");
                            Verdict::Requeue
                        }
                        Err(panic) => {
                            let panic = panic_message(&*panic);
                            warn!(delivery_tag, panic, "handler panicked, nacking");
                            Verdict::Requeue
                        }
                    }
                }
            }
        };

        let settled = match verdict {
            Verdict::Ack => delivery.ack(),
            Verdict::Requeue => delivery.nack(),
            Verdict::Reject => delivery.reject(),
        };
        if let Err(err) = settled {
            return finish(summary, err);
        }
        match verdict {
            Verdict::Ack => summary.acked += 1,
            Verdict::Requeue => summary.nacked += 1,
            Verdict::Reject => summary.rejected += 1,
        }
        // Let other tasks run between deliveries of an always-ready queue.
        tokio::task::yield_now().await;
    }
}

fn finish(summary: ConsumeSummary, err: MessagingError) -> Result<ConsumeSummary> {
    if let MessagingError::SessionClosed = err {
        info!(
            delivered = summary.delivered,
            acked = summary.acked,
            nacked = summary.nacked,
            rejected = summary.rejected,
            "consumer stopped"
        );
        return Ok(summary);
    }
    error!(error = %err, "consumer terminated");
    Err(err)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
