//! Server-side connection records of the in-process broker.
//!
//! Each open session owns one record in the [`ConnectionRegistry`]. The
//! record carries a `watch` channel the broker uses to tell the session its
//! connection was closed from the server side, and a switch that makes the
//! connection stop answering heartbeats.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Channel number, unique within one connection. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-side view of one client connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Authenticated username.
    pub user: String,
    /// `Some(reason)` once the broker closed the connection.
    closed: watch::Sender<Option<String>>,
    heartbeats_suspended: AtomicBool,
}

impl ConnectionHandle {
    /// Returns a receiver that changes to `Some(reason)` when the broker
    /// closes this connection.
    #[must_use]
    pub fn closed_receiver(&self) -> watch::Receiver<Option<String>> {
        self.closed.subscribe()
    }

    /// Marks the connection closed by the server and wakes every receiver.
    pub(crate) fn signal_closed(&self, reason: &str) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        });
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    /// Whether heartbeat frames currently go unanswered.
    #[must_use]
    pub fn heartbeats_suspended(&self) -> bool {
        self.heartbeats_suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_heartbeats_suspended(&self, suspended: bool) {
        self.heartbeats_suspended.store(suspended, Ordering::Release);
    }
}

/// Thread-safe registry of open connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    ///
    /// Connection IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection authenticated as `user`.
    pub fn register(&self, user: &str) -> Arc<ConnectionHandle> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (closed, _rx) = watch::channel(None);
        let handle = Arc::new(ConnectionHandle {
            id,
            user: user.to_string(),
            closed,
            heartbeats_suspended: AtomicBool::new(false),
        });
        self.connections.insert(id, Arc::clone(&handle));
        handle
    }

    /// Removes a connection from the registry, returning its handle if found.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
