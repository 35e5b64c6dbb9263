//! Connection sessions.
//!
//! A [`Session`] owns one connection to a [`Broker`] and hands out channels,
//! one per producer or consumer loop. Every channel's cancellation token is
//! a child of the session's, so closing or losing the session stops every
//! loop built on it.
//!
//! A background monitor watches the connection: it observes a
//! broker-initiated close immediately and sends heartbeats every
//! `heartbeat` interval, failing the session after
//! [`MISSED_HEARTBEAT_LIMIT`] unanswered beats. A connection left without
//! any open channel for `timeout` is cut off as idle.

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{Broker, ChannelId, ConnectionHandle, ConnectionId};
use crate::channel::Channel;
use crate::config::{ConnectionConfig, ReconnectPolicy};
use crate::error::{MessagingError, Result};

/// Consecutive unanswered heartbeats after which the connection is dead.
pub const MISSED_HEARTBEAT_LIMIT: u32 = 2;

/// Lifecycle of a session or a channel.
///
/// State machine: Open -> Closed | Failed. Both end states are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Closed on request.
    Closed,
    /// Lost; carries the reason.
    Failed(String),
}

impl SessionState {
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Moves `cell` out of `Open`. Returns `false` if it had already left.
pub(crate) fn leave_open(cell: &ArcSwap<SessionState>, next: SessionState) -> bool {
    let current = cell.load();
    if !current.is_open() {
        return false;
    }
    let previous = cell.compare_and_swap(&*current, Arc::new(next));
    Arc::ptr_eq(&previous, &current)
}

pub(crate) struct SessionInner {
    pub(crate) broker: Arc<Broker>,
    pub(crate) connection: Arc<ConnectionHandle>,
    pub(crate) state: ArcSwap<SessionState>,
    pub(crate) cancel: CancellationToken,
    config: ConnectionConfig,
    next_channel: Mutex<u16>,
    open_channels: watch::Sender<usize>,
}

impl SessionInner {
    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.connection.id
    }

    pub(crate) fn state(&self) -> SessionState {
        (**self.state.load()).clone()
    }

    /// Error describing why the session is unusable, if it is.
    pub(crate) fn closed_error(&self) -> Option<MessagingError> {
        match &**self.state.load() {
            SessionState::Open => None,
            SessionState::Closed => Some(MessagingError::SessionClosed),
            SessionState::Failed(reason) => Some(MessagingError::Connection(reason.clone())),
        }
    }

    pub(crate) fn channel_released(&self) {
        self.open_channels.send_modify(|open| *open = open.saturating_sub(1));
    }

    fn fail(&self, reason: String) {
        if !leave_open(&self.state, SessionState::Failed(reason.clone())) {
            return;
        }
        error!(connection = self.connection.id.0, reason = %reason, "connection failed");
        self.cancel.cancel();
        self.broker.close_connection(self.connection.id);
    }

    fn close(&self) -> bool {
        if !leave_open(&self.state, SessionState::Closed) {
            return false;
        }
        self.cancel.cancel();
        self.broker.close_connection(self.connection.id);
        true
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to one open connection. Cheap to clone; all clones share the
/// same connection and state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.inner.connection.id)
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a connection to `broker`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the endpoint refuses the
    /// connection, the credentials are rejected, or the handshake does not
    /// complete within `config.timeout`.
    ///
    /// Once open, the session fails with a connection error if it spends
    /// `config.timeout` without any open channel. A zero timeout disables
    /// both bounds.
    pub async fn open(broker: Arc<Broker>, config: ConnectionConfig) -> Result<Self> {
        let handshake = broker.connect(&config.endpoint, &config.credentials);
        let bound = if config.timeout.is_zero() {
            Duration::MAX
        } else {
            config.timeout
        };
        let Ok(connection) = tokio::time::timeout(bound, handshake).await else {
            return Err(MessagingError::Connection(format!(
                "handshake with {} timed out after {:?}",
                config.endpoint, config.timeout
            )));
        };
        let connection = connection?;

        let closed_rx = connection.closed_receiver();
        let heartbeat = config.heartbeat;
        let idle_timeout = config.timeout;
        let (open_channels, open_rx) = watch::channel(0);
        let inner = Arc::new(SessionInner {
            broker,
            connection,
            state: ArcSwap::from_pointee(SessionState::Open),
            cancel: CancellationToken::new(),
            config,
            next_channel: Mutex::new(1),
            open_channels,
        });

        tokio::spawn(monitor(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            closed_rx,
            open_rx,
            Timing {
                heartbeat,
                idle_timeout,
            },
        ));

        info!(
            connection = inner.connection.id.0,
            endpoint = %inner.config.endpoint,
            heartbeat_ms = heartbeat.as_millis(),
            "session opened"
        );
        Ok(Self { inner })
    }

    /// Opens a session, retrying connection failures per `policy`.
    ///
    /// The session never reconnects on its own once open; the owning
    /// process calls this again after a failure.
    ///
    /// # Errors
    ///
    /// Returns the last [`MessagingError::Connection`] once every attempt
    /// has failed.
    pub async fn open_with_retry(
        broker: Arc<Broker>,
        config: ConnectionConfig,
        policy: &ReconnectPolicy,
    ) -> Result<Self> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::open(Arc::clone(&broker), config.clone()).await {
                Ok(session) => return Ok(session),
                Err(err) if attempt < max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Opens a new channel.
    ///
    /// Channel creation is serialized per session.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::SessionClosed`] after [`close`](Self::close).
    /// - [`MessagingError::Connection`] after a connection failure.
    /// - [`MessagingError::Channel`] once `channel_max` channels were opened.
    pub async fn channel(&self) -> Result<Channel> {
        let mut next = self.inner.next_channel.lock().await;
        if let Some(err) = self.inner.closed_error() {
            return Err(err);
        }
        let id = *next;
        if id > self.inner.config.channel_max {
            return Err(MessagingError::Channel(format!(
                "channel_max {} reached",
                self.inner.config.channel_max
            )));
        }
        self.inner
            .broker
            .open_channel(self.inner.connection.id, ChannelId(id))?;
        *next += 1;
        self.inner.open_channels.send_modify(|open| *open += 1);
        Ok(Channel::new(ChannelId(id), Arc::clone(&self.inner)))
    }

    /// Closes every channel, then the connection. Idempotent.
    pub fn close(&self) {
        if self.inner.close() {
            info!(connection = self.inner.connection.id.0, "session closed");
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.load().is_open()
    }

    /// Broker-side identifier of this session's connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection.id
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.inner.broker
    }

    /// Resolves once the session has left the `Open` state.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    heartbeat: Duration,
    idle_timeout: Duration,
}

/// Watches the connection until the session leaves `Open`.
async fn monitor(
    session: Weak<SessionInner>,
    cancel: CancellationToken,
    mut closed_rx: watch::Receiver<Option<String>>,
    mut open_channels: watch::Receiver<usize>,
    timing: Timing,
) {
    let Timing {
        heartbeat,
        idle_timeout,
    } = timing;
    let mut ticker = (!heartbeat.is_zero()).then(|| {
        let start = Instant::now() + heartbeat;
        let mut interval = tokio::time::interval_at(start, heartbeat);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut missed = 0u32;

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);
    let mut idle_armed = !idle_timeout.is_zero() && *open_channels.borrow_and_update() == 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = open_channels.changed() => {
                if changed.is_err() {
                    return;
                }
                idle_armed = !idle_timeout.is_zero() && *open_channels.borrow_and_update() == 0;
                if idle_armed {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
            }
            () = &mut idle, if idle_armed => {
                if let Some(inner) = session.upgrade() {
                    inner.fail(format!("connection idle for {idle_timeout:?}, closed"));
                }
                return;
            }
            changed = closed_rx.changed() => {
                let reason = match changed {
                    Ok(()) => closed_rx
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "connection closed by broker".to_string()),
                    Err(_) => "connection lost".to_string(),
                };
                if let Some(inner) = session.upgrade() {
                    inner.fail(reason);
                }
                return;
            }
            () = tick(ticker.as_mut()) => {
                let Some(inner) = session.upgrade() else {
                    return;
                };
                match inner.broker.heartbeat(inner.connection_id()) {
                    Ok(true) => missed = 0,
                    Ok(false) => {
                        missed += 1;
                        warn!(
                            connection = inner.connection_id().0,
                            missed,
                            "heartbeat not acknowledged"
                        );
                        if missed >= MISSED_HEARTBEAT_LIMIT {
                            inner.fail(format!(
                                "missed {missed} heartbeats, connection presumed dead"
                            ));
                            return;
                        }
                    }
                    Err(err) => {
                        inner.fail(err.to_string());
                        return;
                    }
                }
            }
        }
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
