//! In-process broker substrate with AMQP 0-9-1 semantics.
//!
//! One [`Broker`] is one virtual host: exchanges, queues, bindings, open
//! channels and their unacknowledged deliveries, all behind a single
//! `parking_lot::Mutex` that is never held across an await point. Sessions
//! reach it through an `Arc<Broker>`.
//!
//! Behaviour follows the protocol where it matters to clients:
//!
//! - the nameless default exchange routes to the queue named by the key;
//! - a nacked message goes back to the head of its queue, flagged redelivered;
//! - unacknowledged deliveries are requeued when their channel closes;
//! - a publish to a full queue is refused as a whole (reject-publish).

pub mod connection;
pub mod queue;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchboard_core::{
    Binding, BindingPattern, Exchange, ExchangeDeclaration, ExchangeKind, MessageEnvelope,
    RouteSet, DEFAULT_EXCHANGE,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{BrokerLimits, Credentials, Endpoint};
use crate::error::{MessagingError, Result};

pub use connection::{ChannelId, ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use queue::{QueueDeclaration, QueueStats, QueuedMessage};

use queue::Queue;

/// Result of handing an envelope to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker took the envelope. `routed_to` may be zero (unroutable).
    Accepted { routed_to: usize },
    /// The broker refused the envelope; nothing was enqueued.
    NotAccepted { reason: String },
}

impl PublishOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// A message handed out by [`Broker::basic_get`].
#[derive(Debug, Clone)]
pub struct Fetched {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub envelope: Arc<MessageEnvelope>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: QueuedMessage,
}

#[derive(Debug, Default)]
struct ChannelRecord {
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consuming: Option<String>,
}

#[derive(Debug)]
struct VirtualHost {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<(ConnectionId, ChannelId), ChannelRecord>,
}

impl VirtualHost {
    fn new() -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert(
            DEFAULT_EXCHANGE.to_string(),
            Exchange::new(ExchangeDeclaration::durable(DEFAULT_EXCHANGE, ExchangeKind::Direct)),
        );
        Self {
            exchanges,
            queues: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    fn route(&self, exchange: &Exchange, envelope: &MessageEnvelope) -> RouteSet {
        if exchange.declaration().is_default() {
            let mut routed = RouteSet::new();
            if self.queues.contains_key(&envelope.routing_key) {
                routed.insert(envelope.routing_key.clone());
            }
            return routed;
        }
        exchange.route(envelope)
    }

    fn channel_mut(&mut self, conn: ConnectionId, ch: ChannelId) -> Result<&mut ChannelRecord> {
        self.channels
            .get_mut(&(conn, ch))
            .ok_or_else(|| MessagingError::Channel(format!("channel {ch} is not open")))
    }

    /// Returns a message to its queue, or discards it once it has used up
    /// its redeliveries. A deleted queue drops it.
    fn return_message(
        &mut self,
        queue: &str,
        message: QueuedMessage,
        limits: &BrokerLimits,
    ) -> &'static str {
        let Some(q) = self.queues.get_mut(queue) else {
            return "dropped";
        };
        let redeliveries = message.delivery_count.saturating_sub(1);
        if limits.max_redeliveries.is_some_and(|max| redeliveries >= max) {
            warn!(
                queue,
                redeliveries,
                routing_key = %message.envelope.routing_key,
                "redelivery limit reached, discarding message"
            );
            return "discarded";
        }
        q.requeue(message);
        "requeued"
    }

    /// Drops a channel record, requeueing its unacked deliveries in their
    /// original order.
    fn release_channel(
        &mut self,
        conn: ConnectionId,
        ch: ChannelId,
        limits: &BrokerLimits,
    ) -> usize {
        let Some(record) = self.channels.remove(&(conn, ch)) else {
            return 0;
        };
        if let Some(queue) = &record.consuming {
            if let Some(q) = self.queues.get_mut(queue) {
                q.consumers = q.consumers.saturating_sub(1);
            }
        }
        let count = record.unacked.len();
        for (_, unacked) in record.unacked.into_iter().rev() {
            self.return_message(&unacked.queue, unacked.message, limits);
        }
        count
    }

    fn release_connection(&mut self, conn: ConnectionId, limits: &BrokerLimits) -> usize {
        let ids: Vec<ChannelId> = self
            .channels
            .keys()
            .filter(|(c, _)| *c == conn)
            .map(|(_, ch)| *ch)
            .collect();
        ids.into_iter()
            .map(|ch| self.release_channel(conn, ch, limits))
            .sum()
    }
}

/// An in-process message broker.
#[derive(Debug)]
pub struct Broker {
    endpoint: Endpoint,
    users: HashMap<String, String>,
    limits: BrokerLimits,
    vhost: Mutex<VirtualHost>,
    connections: ConnectionRegistry,
    unresponsive: AtomicBool,
}

impl Broker {
    /// A broker listening on `endpoint` that accepts `guest`/`guest`.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        let defaults = Credentials::default();
        let mut users = HashMap::new();
        users.insert(defaults.username, defaults.password);
        Self {
            endpoint,
            users,
            limits: BrokerLimits::default(),
            vhost: Mutex::new(VirtualHost::new()),
            connections: ConnectionRegistry::new(),
            unresponsive: AtomicBool::new(false),
        }
    }

    /// Adds (or replaces) an accepted login.
    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: BrokerLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    // -----------------------------------------------------------------------
    // Connections and channels
    // -----------------------------------------------------------------------

    /// Performs the connection handshake.
    ///
    /// While the broker is unresponsive the handshake never completes; the
    /// caller bounds it with its own timeout.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] when `endpoint` is not this
    /// broker's address or the credentials are rejected.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<ConnectionHandle>> {
        if *endpoint != self.endpoint {
            return Err(MessagingError::Connection(format!(
                "connection refused by {endpoint}"
            )));
        }
        if self.unresponsive.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        if self.users.get(&credentials.username) != Some(&credentials.password) {
            warn!(user = %credentials.username, "login refused");
            return Err(MessagingError::Connection(format!(
                "ACCESS_REFUSED - login refused for user {:?}",
                credentials.username
            )));
        }
        let handle = self.connections.register(&credentials.username);
        info!(connection = handle.id.0, user = %handle.user, "connection accepted");
        Ok(handle)
    }

    /// Answers a heartbeat frame. `Ok(false)` means the frame went unanswered.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the broker no longer knows
    /// the connection.
    pub fn heartbeat(&self, conn: ConnectionId) -> Result<bool> {
        let handle = self
            .connections
            .get(conn)
            .ok_or_else(|| MessagingError::Connection("connection closed by broker".into()))?;
        if let Some(reason) = handle.close_reason() {
            return Err(MessagingError::Connection(reason));
        }
        Ok(!(self.unresponsive.load(Ordering::Acquire) || handle.heartbeats_suspended()))
    }

    /// Client-initiated connection close. Requeues every unacked delivery
    /// of the connection's channels.
    pub fn close_connection(&self, conn: ConnectionId) {
        if self.connections.remove(conn).is_none() {
            return;
        }
        let requeued = self.vhost.lock().release_connection(conn, &self.limits);
        info!(connection = conn.0, requeued, "connection closed");
    }

    /// Server-initiated connection close: the client is told immediately.
    ///
    /// Returns `false` if the connection was not open.
    pub fn drop_connection(&self, conn: ConnectionId, reason: &str) -> bool {
        let Some(handle) = self.connections.remove(conn) else {
            return false;
        };
        let requeued = self.vhost.lock().release_connection(conn, &self.limits);
        warn!(connection = conn.0, reason, requeued, "connection forced closed");
        handle.signal_closed(reason);
        true
    }

    /// Stops answering heartbeats on one connection.
    pub fn suspend_heartbeats(&self, conn: ConnectionId, suspended: bool) {
        if let Some(handle) = self.connections.get(conn) {
            handle.set_heartbeats_suspended(suspended);
        }
    }

    /// While set, handshakes stall and no heartbeat is answered.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::Release);
    }

    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the connection is gone and
    /// [`MessagingError::Channel`] if the channel number is taken.
    pub fn open_channel(&self, conn: ConnectionId, ch: ChannelId) -> Result<()> {
        self.require_connection(conn)?;
        let mut vhost = self.vhost.lock();
        if vhost.channels.contains_key(&(conn, ch)) {
            return Err(MessagingError::Channel(format!("channel {ch} already open")));
        }
        vhost.channels.insert((conn, ch), ChannelRecord::default());
        debug!(connection = conn.0, channel = ch.0, "channel opened");
        Ok(())
    }

    /// Closes a channel and requeues its unacked deliveries. Returns how
    /// many were requeued.
    pub fn close_channel(&self, conn: ConnectionId, ch: ChannelId) -> usize {
        let requeued = self.vhost.lock().release_channel(conn, ch, &self.limits);
        debug!(connection = conn.0, channel = ch.0, requeued, "channel closed");
        requeued
    }

    fn require_connection(&self, conn: ConnectionId) -> Result<()> {
        match self.connections.get(conn) {
            Some(_) => Ok(()),
            None => Err(MessagingError::Connection("connection closed".into())),
        }
    }

    // -----------------------------------------------------------------------
    // Topology
    // -----------------------------------------------------------------------

    /// Declares an exchange. Idempotent for an equivalent declaration.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ExchangeConflict`] if the name exists with
    /// another kind or durability; the existing exchange is left untouched.
    pub fn declare_exchange(&self, decl: &ExchangeDeclaration) -> Result<()> {
        let mut vhost = self.vhost.lock();
        if let Some(existing) = vhost.exchanges.get(&decl.name) {
            if existing.is_equivalent(decl) {
                return Ok(());
            }
            return Err(MessagingError::exchange_conflict(existing.declaration(), decl));
        }
        vhost
            .exchanges
            .insert(decl.name.clone(), Exchange::new(decl.clone()));
        info!(
            exchange = %decl.name,
            kind = %decl.kind,
            durable = decl.durable,
            "exchange declared"
        );
        Ok(())
    }

    /// Deletes an exchange and its bindings. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Channel`] for the default exchange.
    pub fn delete_exchange(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_EXCHANGE {
            return Err(MessagingError::Channel(
                "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
            ));
        }
        let removed = self.vhost.lock().exchanges.remove(name);
        if let Some(exchange) = &removed {
            info!(exchange = name, bindings = exchange.binding_count(), "exchange deleted");
        }
        Ok(removed.is_some())
    }

    #[must_use]
    pub fn exchange_declaration(&self, name: &str) -> Option<ExchangeDeclaration> {
        self.vhost
            .lock()
            .exchanges
            .get(name)
            .map(|e| e.declaration().clone())
    }

    /// Declares a queue and reports its counters. Idempotent for an
    /// equivalent declaration.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::QueueConflict`] if the queue exists with a
    /// different durability or capacity.
    pub fn declare_queue(&self, decl: &QueueDeclaration) -> Result<QueueStats> {
        let mut vhost = self.vhost.lock();
        if let Some(existing) = vhost.queues.get(&decl.name) {
            let same_capacity =
                decl.max_length.is_none() || decl.max_length == existing.declaration.max_length;
            if existing.declaration.durable != decl.durable || !same_capacity {
                return Err(MessagingError::QueueConflict {
                    queue: decl.name.clone(),
                });
            }
        } else {
            vhost.queues.insert(
                decl.name.clone(),
                Queue::new(decl.clone(), self.limits.default_max_length),
            );
            info!(queue = %decl.name, durable = decl.durable, "queue declared");
        }
        Ok(stats_of(&vhost, &decl.name))
    }

    /// Deletes a queue, its bindings and its ready messages. Returns the
    /// number of discarded messages; zero if the queue did not exist.
    ///
    /// Consumers waiting on the queue are woken and fail with a channel error.
    pub fn delete_queue(&self, name: &str) -> usize {
        let mut vhost = self.vhost.lock();
        let Some(queue) = vhost.queues.remove(name) else {
            return 0;
        };
        let bindings: usize = vhost
            .exchanges
            .values_mut()
            .map(|ex| ex.remove_queue(name))
            .sum();
        queue.notify.notify_waiters();
        info!(queue = name, bindings, discarded = queue.messages.len(), "queue deleted");
        queue.messages.len()
    }

    /// # Errors
    ///
    /// Returns [`MessagingError::NotFound`] if the queue does not exist.
    pub fn queue_stats(&self, name: &str) -> Result<QueueStats> {
        let vhost = self.vhost.lock();
        if !vhost.queues.contains_key(name) {
            return Err(not_found("queue", name));
        }
        Ok(stats_of(&vhost, name))
    }

    /// Binds a queue to an exchange. Returns `false` for a duplicate.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::InvalidBinding`] for the default exchange or a
    ///   pattern that does not fit the exchange kind.
    /// - [`MessagingError::NotFound`] if the exchange or queue is missing.
    pub fn bind(&self, binding: &Binding) -> Result<bool> {
        if binding.exchange == DEFAULT_EXCHANGE {
            return Err(MessagingError::InvalidBinding(
                "queues cannot be bound to the default exchange".into(),
            ));
        }
        let mut vhost = self.vhost.lock();
        if !vhost.queues.contains_key(&binding.queue) {
            return Err(not_found("queue", &binding.queue));
        }
        let exchange = vhost
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| not_found("exchange", &binding.exchange))?;
        let added = exchange.bind(&binding.queue, &binding.pattern)?;
        if added {
            info!(
                exchange = %binding.exchange,
                queue = %binding.queue,
                pattern = %binding.pattern,
                "queue bound"
            );
        }
        Ok(added)
    }

    /// [`Broker::bind`] by parts.
    ///
    /// # Errors
    ///
    /// See [`Broker::bind`].
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: BindingPattern) -> Result<bool> {
        self.bind(&Binding::new(queue, exchange, pattern))
    }

    /// Removes a binding. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotFound`] if the exchange does not exist.
    pub fn unbind(&self, binding: &Binding) -> Result<bool> {
        let mut vhost = self.vhost.lock();
        let exchange = vhost
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| not_found("exchange", &binding.exchange))?;
        let removed = exchange.unbind(&binding.queue, &binding.pattern);
        if removed {
            info!(exchange = %binding.exchange, queue = %binding.queue, "queue unbound");
        }
        Ok(removed)
    }

    /// Bindings currently held by an exchange.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<Binding> {
        self.vhost
            .lock()
            .exchanges
            .get(exchange)
            .map(Exchange::bindings)
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Routes `envelope` through `exchange` and enqueues a copy on every
    /// selected queue.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Connection`] / [`MessagingError::Channel`] if the
    ///   connection or channel is not open.
    /// - [`MessagingError::NotFound`] if the exchange does not exist.
    pub fn publish(
        &self,
        conn: ConnectionId,
        ch: ChannelId,
        exchange: &str,
        envelope: MessageEnvelope,
    ) -> Result<PublishOutcome> {
        self.require_connection(conn)?;
        let mut vhost = self.vhost.lock();
        vhost.channel_mut(conn, ch)?;
        let ex = vhost
            .exchanges
            .get(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;
        let routed = vhost.route(ex, &envelope);

        if routed.is_empty() {
            debug!(exchange, routing_key = %envelope.routing_key, "message unroutable, dropped");
            metrics::counter!("switchboard_published_total",
                "exchange" => exchange.to_string(), "outcome" => "unroutable")
            .increment(1);
            return Ok(PublishOutcome::Accepted { routed_to: 0 });
        }

        let full = routed.iter().find_map(|name| {
            let q = vhost.queues.get(name)?;
            q.is_full().then(|| (name.clone(), q.max_length.unwrap_or_default()))
        });
        if let Some((queue, max)) = full {
            warn!(exchange, queue = %queue, max_length = max, "publish not accepted, queue full");
            metrics::counter!("switchboard_published_total",
                "exchange" => exchange.to_string(), "outcome" => "not_accepted")
            .increment(1);
            return Ok(PublishOutcome::NotAccepted {
                reason: format!("queue {queue:?} is at max-length {max}"),
            });
        }

        let envelope = Arc::new(envelope);
        for name in &routed {
            if let Some(q) = vhost.queues.get_mut(name) {
                q.push(QueuedMessage::new(Arc::clone(&envelope), exchange));
            }
        }
        debug!(
            exchange,
            routing_key = %envelope.routing_key,
            queues = routed.len(),
            "message routed"
        );
        metrics::counter!("switchboard_published_total",
            "exchange" => exchange.to_string(), "outcome" => "accepted")
        .increment(1);
        Ok(PublishOutcome::Accepted {
            routed_to: routed.len(),
        })
    }

    /// Marks the channel as the consumer of `queue`. Registering the same
    /// queue again is a no-op; registering another queue moves the channel.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Channel`] if the channel is not open and
    /// [`MessagingError::NotFound`] if the queue does not exist.
    pub fn register_consumer(
        &self,
        conn: ConnectionId,
        ch: ChannelId,
        queue: &str,
    ) -> Result<()> {
        self.require_connection(conn)?;
        let mut vhost = self.vhost.lock();
        let previous = vhost.channel_mut(conn, ch)?.consuming.clone();
        if previous.as_deref() == Some(queue) {
            return Ok(());
        }
        let q = vhost
            .queues
            .get_mut(queue)
            .ok_or_else(|| not_found("queue", queue))?;
        q.consumers += 1;
        if let Some(previous) = &previous {
            if let Some(old) = vhost.queues.get_mut(previous) {
                old.consumers = old.consumers.saturating_sub(1);
            }
        }
        vhost.channel_mut(conn, ch)?.consuming = Some(queue.to_string());
        Ok(())
    }

    /// Wake-up handle signalled whenever `queue` receives a message.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotFound`] if the queue does not exist.
    pub fn queue_notify(&self, queue: &str) -> Result<Arc<Notify>> {
        self.vhost
            .lock()
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.notify))
            .ok_or_else(|| not_found("queue", queue))
    }

    /// Takes the next ready message from `queue`, tracking it as unacked on
    /// the channel. `Ok(None)` when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotFound`] if the queue does not exist, or
    /// a connection/channel error if either is closed.
    pub fn basic_get(
        &self,
        conn: ConnectionId,
        ch: ChannelId,
        queue: &str,
    ) -> Result<Option<Fetched>> {
        self.require_connection(conn)?;
        let mut vhost = self.vhost.lock();
        vhost.channel_mut(conn, ch)?;
        let q = vhost
            .queues
            .get_mut(queue)
            .ok_or_else(|| not_found("queue", queue))?;
        let Some(mut message) = q.pop() else {
            return Ok(None);
        };
        message.delivery_count += 1;

        let record = vhost.channel_mut(conn, ch)?;
        record.next_tag += 1;
        let delivery_tag = record.next_tag;
        let fetched = Fetched {
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            envelope: Arc::clone(&message.envelope),
        };
        record.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                message,
            },
        );
        metrics::counter!("switchboard_deliveries_total", "queue" => queue.to_string())
            .increment(1);
        Ok(Some(fetched))
    }

    /// Settles a delivery positively.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Channel`] for an unknown delivery tag.
    pub fn ack(&self, conn: ConnectionId, ch: ChannelId, delivery_tag: u64) -> Result<()> {
        self.require_connection(conn)?;
        let mut vhost = self.vhost.lock();
        let unacked = take_unacked(vhost.channel_mut(conn, ch)?, delivery_tag)?;
        metrics::counter!("switchboard_acks_total", "queue" => unacked.queue).increment(1);
        Ok(())
    }

    /// Settles a delivery negatively. With `requeue` the message returns to
    /// the head of its queue flagged redelivered, otherwise it is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Channel`] for an unknown delivery tag.
    pub fn nack(
        &self,
        conn: ConnectionId,
        ch: ChannelId,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<()> {
        self.require_connection(conn)?;
        let mut vhost = self.vhost.lock();
        let unacked = take_unacked(vhost.channel_mut(conn, ch)?, delivery_tag)?;
        let reason = if requeue {
            vhost.return_message(&unacked.queue, unacked.message, &self.limits)
        } else {
            debug!(queue = %unacked.queue, delivery_tag, "message rejected without requeue");
            "rejected"
        };
        metrics::counter!("switchboard_nacks_total",
            "queue" => unacked.queue, "reason" => reason)
        .increment(1);
        Ok(())
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(Endpoint::default())
    }
}

fn take_unacked(record: &mut ChannelRecord, delivery_tag: u64) -> Result<Unacked> {
    record.unacked.remove(&delivery_tag).ok_or_else(|| {
        MessagingError::Channel(format!(
            "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
        ))
    })
}

fn stats_of(vhost: &VirtualHost, queue: &str) -> QueueStats {
    let (message_count, consumer_count) = vhost
        .queues
        .get(queue)
        .map_or((0, 0), |q| (q.messages.len(), q.consumers));
    let unacked_count = vhost
        .channels
        .values()
        .flat_map(|record| record.unacked.values())
        .filter(|u| u.queue == queue)
        .count();
    QueueStats {
        message_count,
        unacked_count,
        consumer_count,
    }
}

fn not_found(kind: &'static str, name: &str) -> MessagingError {
    MessagingError::NotFound {
        kind,
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use switchboard_core::header::headers;
    use switchboard_core::HeaderMatch;

    use super::*;

    const CONN_CH: ChannelId = ChannelId(1);

    async fn broker_with_channel(limits: BrokerLimits) -> (Broker, ConnectionId) {
        let broker = Broker::default().with_limits(limits);
        let handle = broker
            .connect(&Endpoint::default(), &Credentials::default())
            .await
            .unwrap();
        broker.open_channel(handle.id, CONN_CH).unwrap();
        (broker, handle.id)
    }

    fn declare(
        broker: &Broker,
        exchange: &str,
        kind: ExchangeKind,
        queues: &[(&str, BindingPattern)],
    ) {
        broker
            .declare_exchange(&ExchangeDeclaration::durable(exchange, kind))
            .unwrap();
        for (queue, pattern) in queues {
            broker.declare_queue(&QueueDeclaration::durable(*queue)).unwrap();
            broker.bind_queue(queue, exchange, pattern.clone()).unwrap();
        }
    }

    fn ready(broker: &Broker, queue: &str) -> usize {
        broker.queue_stats(queue).unwrap().message_count
    }

    #[tokio::test]
    async fn connect_checks_endpoint_and_credentials() {
        let broker = Broker::default().with_user("svc", "secret");
        let wrong_port = Endpoint::new("localhost", 5673);
        let err = broker
            .connect(&wrong_port, &Credentials::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Connection(_)));

        let err = broker
            .connect(&Endpoint::default(), &Credentials::new("svc", "nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ACCESS_REFUSED"));

        broker
            .connect(&Endpoint::default(), &Credentials::new("svc", "secret"))
            .await
            .unwrap();
        assert_eq!(broker.connection_count(), 1);
    }

    #[test]
    fn exchange_redeclaration() {
        let broker = Broker::default();
        let direct = ExchangeDeclaration::durable("orders", ExchangeKind::Direct);
        broker.declare_exchange(&direct).unwrap();
        broker.declare_exchange(&direct).unwrap();

        let topic = ExchangeDeclaration::durable("orders", ExchangeKind::Topic);
        let err = broker.declare_exchange(&topic).unwrap_err();
        assert!(matches!(err, MessagingError::ExchangeConflict { .. }));
        assert_eq!(broker.exchange_declaration("orders"), Some(direct));

        let default_as_fanout = ExchangeDeclaration::durable("", ExchangeKind::Fanout);
        assert!(broker.declare_exchange(&default_as_fanout).is_err());
    }

    #[test]
    fn queue_redeclaration() {
        let broker = Broker::default();
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        let err = broker.declare_queue(&QueueDeclaration::transient("q")).unwrap_err();
        assert!(matches!(err, MessagingError::QueueConflict { .. }));
    }

    #[test]
    fn default_exchange_cannot_be_bound_or_deleted() {
        let broker = Broker::default();
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        assert!(matches!(
            broker.bind_queue("q", "", BindingPattern::key("q")),
            Err(MessagingError::InvalidBinding(_))
        ));
        assert!(broker.delete_exchange("").is_err());
    }

    #[test]
    fn bind_requires_both_ends() {
        let broker = Broker::default();
        broker
            .declare_exchange(&ExchangeDeclaration::durable("ex", ExchangeKind::Direct))
            .unwrap();
        assert!(matches!(
            broker.bind_queue("missing", "ex", BindingPattern::key("k")),
            Err(MessagingError::NotFound { kind: "queue", .. })
        ));
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        assert!(matches!(
            broker.bind_queue("q", "nope", BindingPattern::key("k")),
            Err(MessagingError::NotFound { kind: "exchange", .. })
        ));
    }

    #[tokio::test]
    async fn publish_via_default_exchange() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        broker.declare_queue(&QueueDeclaration::durable("jobs")).unwrap();

        let env = MessageEnvelope::new("{}").with_routing_key("jobs");
        let outcome = broker.publish(conn, CONN_CH, "", env).unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted { routed_to: 1 });
        assert_eq!(ready(&broker, "jobs"), 1);

        let env = MessageEnvelope::new("{}").with_routing_key("other");
        let outcome = broker.publish(conn, CONN_CH, "", env).unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted { routed_to: 0 });
    }

    #[tokio::test]
    async fn fanout_copies_to_every_queue() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        declare(
            &broker,
            "fanout-exchange",
            ExchangeKind::Fanout,
            &[
                ("notification-queue-1", BindingPattern::fanout()),
                ("notification-queue-2", BindingPattern::fanout()),
            ],
        );
        let outcome = broker
            .publish(conn, CONN_CH, "fanout-exchange", MessageEnvelope::new("hi"))
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted { routed_to: 2 });
        assert_eq!(ready(&broker, "notification-queue-1"), 1);
        assert_eq!(ready(&broker, "notification-queue-2"), 1);
    }

    #[tokio::test]
    async fn headers_exchange_routes_by_rule() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        let rule = HeaderMatch::all(headers([("priority", "high"), ("source", "payment-service")]));
        declare(&broker, "headers-exchange", ExchangeKind::Headers, &[("log-queue", rule.into())]);

        let hit = MessageEnvelope::new("{}").with_headers(headers([
            ("priority", "high"),
            ("source", "payment-service"),
            ("environment", "production"),
        ]));
        broker.publish(conn, CONN_CH, "headers-exchange", hit).unwrap();
        let miss = MessageEnvelope::new("{}").with_header("priority", "high");
        broker.publish(conn, CONN_CH, "headers-exchange", miss).unwrap();
        assert_eq!(ready(&broker, "log-queue"), 1);
    }

    #[tokio::test]
    async fn publish_to_missing_exchange_is_not_found() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        let err = broker
            .publish(conn, CONN_CH, "nope", MessageEnvelope::new("x"))
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotFound { kind: "exchange", .. }));
    }

    #[tokio::test]
    async fn full_queue_refuses_whole_publish() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        broker
            .declare_exchange(&ExchangeDeclaration::durable("fan", ExchangeKind::Fanout))
            .unwrap();
        broker
            .declare_queue(&QueueDeclaration::durable("small").with_max_length(1))
            .unwrap();
        broker.declare_queue(&QueueDeclaration::durable("big")).unwrap();
        broker.bind_queue("small", "fan", BindingPattern::fanout()).unwrap();
        broker.bind_queue("big", "fan", BindingPattern::fanout()).unwrap();

        assert!(broker
            .publish(conn, CONN_CH, "fan", MessageEnvelope::new("1"))
            .unwrap()
            .is_accepted());
        let outcome = broker
            .publish(conn, CONN_CH, "fan", MessageEnvelope::new("2"))
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::NotAccepted { .. }));
        assert_eq!(ready(&broker, "big"), 1);
        assert_eq!(ready(&broker, "small"), 1);
    }

    #[tokio::test]
    async fn get_ack_nack_cycle() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        broker
            .publish(conn, CONN_CH, "", MessageEnvelope::new("a").with_routing_key("q"))
            .unwrap();

        let first = broker.basic_get(conn, CONN_CH, "q").unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.queue_stats("q").unwrap().unacked_count, 1);

        broker.nack(conn, CONN_CH, first.delivery_tag, true).unwrap();
        let second = broker.basic_get(conn, CONN_CH, "q").unwrap().unwrap();
        assert!(second.redelivered);
        assert_ne!(second.delivery_tag, first.delivery_tag);

        broker.ack(conn, CONN_CH, second.delivery_tag).unwrap();
        assert!(broker.ack(conn, CONN_CH, second.delivery_tag).is_err());
        assert_eq!(broker.queue_stats("q").unwrap(), QueueStats::default());
        assert!(broker.basic_get(conn, CONN_CH, "q").unwrap().is_none());
    }

    #[tokio::test]
    async fn channel_close_requeues_in_order() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        for body in ["a", "b", "c"] {
            broker
                .publish(conn, CONN_CH, "", MessageEnvelope::new(body).with_routing_key("q"))
                .unwrap();
        }
        broker.basic_get(conn, CONN_CH, "q").unwrap().unwrap();
        broker.basic_get(conn, CONN_CH, "q").unwrap().unwrap();

        assert_eq!(broker.close_channel(conn, CONN_CH), 2);
        broker.open_channel(conn, ChannelId(2)).unwrap();
        let bodies: Vec<_> = std::iter::from_fn(|| {
            broker
                .basic_get(conn, ChannelId(2), "q")
                .unwrap()
                .map(|f| (f.envelope.payload.clone(), f.redelivered))
        })
        .collect();
        assert_eq!(
            bodies,
            vec![
                ("a".into(), true),
                ("b".into(), true),
                ("c".into(), false),
            ]
        );
    }

    #[tokio::test]
    async fn redelivery_limit_discards() {
        let limits = BrokerLimits {
            max_redeliveries: Some(1),
            ..BrokerLimits::default()
        };
        let (broker, conn) = broker_with_channel(limits).await;
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        broker
            .publish(conn, CONN_CH, "", MessageEnvelope::new("poison").with_routing_key("q"))
            .unwrap();

        let d1 = broker.basic_get(conn, CONN_CH, "q").unwrap().unwrap();
        broker.nack(conn, CONN_CH, d1.delivery_tag, true).unwrap();
        let d2 = broker.basic_get(conn, CONN_CH, "q").unwrap().unwrap();
        assert!(d2.redelivered);
        broker.nack(conn, CONN_CH, d2.delivery_tag, true).unwrap();
        assert!(broker.basic_get(conn, CONN_CH, "q").unwrap().is_none());
    }

    #[tokio::test]
    async fn register_consumer_counts_each_channel_once() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        broker.declare_queue(&QueueDeclaration::durable("jobs")).unwrap();
        broker.declare_queue(&QueueDeclaration::durable("other")).unwrap();

        assert!(matches!(
            broker.register_consumer(conn, ChannelId(9), "jobs"),
            Err(MessagingError::Channel(_))
        ));
        assert_eq!(broker.queue_stats("jobs").unwrap().consumer_count, 0);

        broker.register_consumer(conn, CONN_CH, "jobs").unwrap();
        broker.register_consumer(conn, CONN_CH, "jobs").unwrap();
        assert_eq!(broker.queue_stats("jobs").unwrap().consumer_count, 1);

        broker.register_consumer(conn, CONN_CH, "other").unwrap();
        assert_eq!(broker.queue_stats("jobs").unwrap().consumer_count, 0);
        assert_eq!(broker.queue_stats("other").unwrap().consumer_count, 1);

        broker.close_channel(conn, CONN_CH);
        assert_eq!(broker.queue_stats("other").unwrap().consumer_count, 0);
    }

    #[tokio::test]
    async fn delete_queue_removes_bindings() {
        let (broker, conn) = broker_with_channel(BrokerLimits::default()).await;
        declare(
            &broker,
            "direct-exchange",
            ExchangeKind::Direct,
            &[("order-created-queue", BindingPattern::key("order.created"))],
        );
        broker
            .publish(
                conn,
                CONN_CH,
                "direct-exchange",
                MessageEnvelope::new("{}").with_routing_key("order.created"),
            )
            .unwrap();

        assert_eq!(broker.delete_queue("order-created-queue"), 1);
        assert!(broker.bindings("direct-exchange").is_empty());
        assert!(broker.queue_stats("order-created-queue").is_err());
        assert_eq!(broker.delete_queue("order-created-queue"), 0);
    }

    #[tokio::test]
    async fn drop_connection_signals_and_requeues() {
        let broker = Broker::default();
        let handle = broker
            .connect(&Endpoint::default(), &Credentials::default())
            .await
            .unwrap();
        broker.open_channel(handle.id, CONN_CH).unwrap();
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        broker
            .publish(handle.id, CONN_CH, "", MessageEnvelope::new("x").with_routing_key("q"))
            .unwrap();
        broker.basic_get(handle.id, CONN_CH, "q").unwrap().unwrap();

        let rx = handle.closed_receiver();
        assert!(broker.drop_connection(handle.id, "CONNECTION_FORCED"));
        assert_eq!(rx.borrow().as_deref(), Some("CONNECTION_FORCED"));
        assert_eq!(ready(&broker, "q"), 1);
        assert!(matches!(
            broker.heartbeat(handle.id),
            Err(MessagingError::Connection(_))
        ));
        assert!(!broker.drop_connection(handle.id, "again"));
    }

    #[tokio::test]
    async fn heartbeats_go_unanswered_when_suspended() {
        let broker = Broker::default();
        let handle = broker
            .connect(&Endpoint::default(), &Credentials::default())
            .await
            .unwrap();
        assert!(broker.heartbeat(handle.id).unwrap());
        broker.suspend_heartbeats(handle.id, true);
        assert!(!broker.heartbeat(handle.id).unwrap());
        broker.suspend_heartbeats(handle.id, false);
        broker.set_unresponsive(true);
        assert!(!broker.heartbeat(handle.id).unwrap());
    }
}
