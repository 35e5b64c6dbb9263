//! Collaborator-facing messaging interface.
//!
//! [`Messaging`] bundles one producer and any number of consumers over a
//! shared [`Session`]. Publishing never returns an error to the caller:
//! failures are logged and reported as `false`.

use parking_lot::Mutex;
use serde::Serialize;
use switchboard_core::{BindingPattern, ExchangeDeclaration, Headers, MessageEnvelope};
use tracing::{info, warn};

use crate::broker::{PublishOutcome, QueueDeclaration};
use crate::consumer::{Consumer, ConsumerHandle, MessageHandler};
use crate::decode::Decode;
use crate::error::{MessagingError, Result};
use crate::producer::Producer;
use crate::session::Session;

pub struct Messaging {
    session: Session,
    producer: Producer,
    consumers: Mutex<Vec<Consumer>>,
}

impl std::fmt::Debug for Messaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messaging")
            .field("exchange", &self.producer.exchange().name)
            .field("consumers", &self.consumers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Messaging {
    /// Creates the facade and its producer for `exchange`.
    ///
    /// # Errors
    ///
    /// Same as [`Producer::new`].
    pub async fn new(session: Session, exchange: ExchangeDeclaration) -> Result<Self> {
        let producer = Producer::new(&session, exchange).await?;
        Ok(Self {
            session,
            producer,
            consumers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn exchange(&self) -> &ExchangeDeclaration {
        self.producer.exchange()
    }

    /// Publishes `payload` as persistent JSON. Returns whether the broker
    /// accepted it.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        routing_key: Option<&str>,
        headers: Option<Headers>,
    ) -> bool {
        let envelope = match MessageEnvelope::json(payload) {
            Ok(envelope) => envelope
                .with_routing_key(routing_key.unwrap_or_default())
                .with_headers(headers.unwrap_or_default()),
            Err(err) => {
                warn!(error = %MessagingError::Encode(err), "publish failed");
                return false;
            }
        };
        match self.producer.publish(envelope) {
            Ok(PublishOutcome::Accepted { .. }) => true,
            // Already logged by the producer.
            Ok(PublishOutcome::NotAccepted { .. }) => false,
            Err(err) => {
                warn!(
                    exchange = %self.producer.exchange().name,
                    routing_key = routing_key.unwrap_or_default(),
                    error = %err,
                    retryable = err.is_retryable(),
                    "publish failed"
                );
                false
            }
        }
    }

    /// Consumes the durable queue `queue`, fed through the default exchange.
    ///
    /// # Errors
    ///
    /// Errors from [`Consumer::connect`] and [`Consumer::start_consuming`].
    pub async fn on_message<M, H>(&self, queue: &str, handler: H) -> Result<ConsumerHandle>
    where
        M: Decode,
        H: MessageHandler<M>,
    {
        let mut consumer = Consumer::for_queue(QueueDeclaration::durable(queue));
        consumer.connect(&self.session).await?;
        self.start(consumer, handler)
    }

    /// Consumes the durable queue `queue`, bound to this facade's exchange
    /// with `pattern`.
    ///
    /// # Errors
    ///
    /// As [`on_message`](Self::on_message), plus [`Consumer::bind_queue`]
    /// errors.
    pub async fn register_consumer<M, H>(
        &self,
        queue: &str,
        pattern: impl Into<BindingPattern>,
        handler: H,
    ) -> Result<ConsumerHandle>
    where
        M: Decode,
        H: MessageHandler<M>,
    {
        let mut consumer = Consumer::new(
            self.producer.exchange().clone(),
            QueueDeclaration::durable(queue),
        );
        consumer.connect(&self.session).await?;
        consumer.bind_queue(pattern)?;
        self.start(consumer, handler)
    }

    fn start<M, H>(&self, mut consumer: Consumer, handler: H) -> Result<ConsumerHandle>
    where
        M: Decode,
        H: MessageHandler<M>,
    {
        let handle = consumer.start_consuming(handler);
        if handle.is_err() {
            consumer.close();
        } else {
            self.consumers.lock().push(consumer);
        }
        handle
    }

    /// Closes every consumer and the producer. The session stays open.
    pub fn shutdown(&self) {
        let mut consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in &mut consumers {
            consumer.close();
        }
        self.producer.close();
        info!(consumers = consumers.len(), "messaging shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use switchboard_core::header::headers;
    use switchboard_core::{ExchangeKind, HeaderMatch};
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::Broker;
    use crate::config::ConnectionConfig;
    use crate::decode::Json;

    async fn messaging(kind: ExchangeKind) -> (Arc<Broker>, Messaging) {
        let broker = Arc::new(Broker::default());
        let session = Session::open(Arc::clone(&broker), ConnectionConfig::default())
            .await
            .unwrap();
        let messaging = Messaging::new(session, ExchangeDeclaration::durable("events", kind))
            .await
            .unwrap();
        (broker, messaging)
    }

    #[tokio::test]
    async fn publish_reports_acceptance() {
        let (broker, messaging) = messaging(ExchangeKind::Direct).await;
        broker.declare_queue(&QueueDeclaration::durable("q")).unwrap();
        broker
            .bind_queue("q", "events", BindingPattern::key("order.created"))
            .unwrap();

        assert!(messaging.publish(&json!({"id": 1}), Some("order.created"), None));
        // Unroutable is still accepted.
        assert!(messaging.publish(&json!({"id": 2}), None, None));
        assert_eq!(broker.queue_stats("q").unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn publish_returns_false_instead_of_erroring() {
        let (broker, messaging) = messaging(ExchangeKind::Fanout).await;
        broker
            .declare_queue(&QueueDeclaration::durable("small").with_max_length(1))
            .unwrap();
        broker.bind_queue("small", "events", BindingPattern::fanout()).unwrap();

        assert!(messaging.publish(&"first", None, None));
        assert!(!messaging.publish(&"second", None, None));

        broker.delete_exchange("events").unwrap();
        assert!(!messaging.publish(&"third", None, None));
    }

    #[tokio::test]
    async fn publish_with_headers_routes_on_headers_exchange() {
        let (broker, messaging) = messaging(ExchangeKind::Headers).await;
        broker.declare_queue(&QueueDeclaration::durable("logs")).unwrap();
        broker
            .bind_queue(
                "logs",
                "events",
                HeaderMatch::all(headers([("priority", "high"), ("source", "payment-service")]))
                    .into(),
            )
            .unwrap();

        let matching = headers([("priority", "high"), ("source", "payment-service")]);
        assert!(messaging.publish(&"payment failed", None, Some(matching)));
        assert!(messaging.publish(&"partial", None, Some(headers([("priority", "high")]))));
        assert_eq!(broker.queue_stats("logs").unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn on_message_receives_default_exchange_traffic() {
        let (broker, messaging) = messaging(ExchangeKind::Direct).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = messaging
            .on_message("inbox", move |msg: Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    tx.send(msg.into_inner()).ok();
                    anyhow::Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(handle.queue(), "inbox");

        let ch = messaging.session().channel().await.unwrap();
        ch.publish(
            "",
            MessageEnvelope::json(&json!({"hello": "world"}))
                .unwrap()
                .with_routing_key("inbox"),
        )
        .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got["hello"], "world");

        messaging.shutdown();
        let summary = handle.join().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(broker.queue_stats("inbox").unwrap().consumer_count, 0);
    }

    #[tokio::test]
    async fn register_consumer_binds_to_the_exchange() {
        let (_broker, messaging) = messaging(ExchangeKind::Topic).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = messaging
            .register_consumer("all-orders", BindingPattern::key("order.#"), move |msg: String| {
                let tx = tx.clone();
                async move {
                    tx.send(msg).ok();
                    anyhow::Ok(())
                }
            })
            .await
            .unwrap();

        assert!(messaging.publish(&"shipped", Some("order.america.shipped"), None));
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "\"shipped\"");

        handle.shutdown().await.unwrap();
        messaging.shutdown();
    }

    #[tokio::test]
    async fn register_consumer_rejects_mismatched_pattern() {
        let (_broker, messaging) = messaging(ExchangeKind::Topic).await;
        let err = messaging
            .register_consumer(
                "q",
                HeaderMatch::any(headers([("a", "b")])),
                |_: String| async { anyhow::Ok(()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::InvalidBinding(_)));
    }
}
