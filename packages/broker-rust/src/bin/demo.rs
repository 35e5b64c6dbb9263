//! Declares the sample exchange topology on an in-process broker, publishes
//! the test messages and logs what every queue receives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use switchboard_broker::telemetry;
use switchboard_broker::{
    Broker, BrokerSettings, Consumer, ConsumerHandle, Json, Producer, QueueDeclaration, Session,
};
use switchboard_core::header::headers;
use switchboard_core::{BindingPattern, ExchangeDeclaration, ExchangeKind, HeaderMatch};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Deliveries the published test set produces across all queues.
const EXPECTED_DELIVERIES: usize = 11;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct Subscription {
    exchange: ExchangeDeclaration,
    queue: &'static str,
    pattern: BindingPattern,
}

fn topology() -> Vec<Subscription> {
    let direct = ExchangeDeclaration::durable("direct-exchange", ExchangeKind::Direct);
    let fanout = ExchangeDeclaration::durable("fanout-exchange", ExchangeKind::Fanout);
    let topic = ExchangeDeclaration::durable("topic-exchange", ExchangeKind::Topic);
    let logs = ExchangeDeclaration::durable("headers-exchange", ExchangeKind::Headers);

    let sub = |exchange: &ExchangeDeclaration, queue, pattern| Subscription {
        exchange: exchange.clone(),
        queue,
        pattern,
    };
    vec![
        sub(&direct, "order-created-queue", BindingPattern::key("order.created")),
        sub(&direct, "order-cancelled-queue", BindingPattern::key("order.cancelled")),
        sub(&fanout, "notification-queue-1", BindingPattern::fanout()),
        sub(&fanout, "notification-queue-2", BindingPattern::fanout()),
        sub(&topic, "created-orders-queue", BindingPattern::key("order.*.created")),
        sub(&topic, "shipped-orders-queue", BindingPattern::key("order.*.shipped")),
        sub(&topic, "all-orders-queue", BindingPattern::key("order.#")),
        sub(
            &logs,
            "log-queue",
            HeaderMatch::all(headers([("priority", "high"), ("source", "payment-service")])).into(),
        ),
    ]
}

async fn start_consumers(
    session: &Session,
    received: &mpsc::UnboundedSender<&'static str>,
) -> anyhow::Result<Vec<(Consumer, ConsumerHandle)>> {
    let mut running = Vec::new();
    for sub in topology() {
        let mut consumer = Consumer::new(sub.exchange, QueueDeclaration::durable(sub.queue));
        consumer.connect(session).await?;
        consumer.bind_queue(sub.pattern)?;

        let queue = sub.queue;
        let received = received.clone();
        let handle = consumer.start_consuming(move |message: Json<serde_json::Value>| {
            let received = received.clone();
            async move {
                info!(queue, message = %message.0, "received");
                received.send(queue).ok();
                anyhow::Ok(())
            }
        })?;
        running.push((consumer, handle));
    }
    info!(consumers = running.len(), "all consumers initialized and running");
    Ok(running)
}

async fn publish_test_messages(session: &Session) -> anyhow::Result<()> {
    let direct = Producer::new(
        session,
        ExchangeDeclaration::durable("direct-exchange", ExchangeKind::Direct),
    )
    .await?;
    direct.publish_json(
        &json!({"type": "order", "id": "123", "status": "created"}),
        "order.created",
    )?;
    direct.publish_json(
        &json!({"type": "order", "id": "123", "status": "cancelled"}),
        "order.cancelled",
    )?;

    let fanout = Producer::new(
        session,
        ExchangeDeclaration::durable("fanout-exchange", ExchangeKind::Fanout),
    )
    .await?;
    fanout.publish_json(
        &json!({"type": "notification", "message": "System update available"}),
        "",
    )?;

    let topic = Producer::new(
        session,
        ExchangeDeclaration::durable("topic-exchange", ExchangeKind::Topic),
    )
    .await?;
    for (id, region, status) in [
        ("123", "europe", "created"),
        ("456", "asia", "created"),
        ("789", "america", "shipped"),
    ] {
        topic.publish_json(
            &json!({"type": "order", "id": id, "region": region, "status": status}),
            &format!("order.{region}.{status}"),
        )?;
    }

    let logs = Producer::new(
        session,
        ExchangeDeclaration::durable("headers-exchange", ExchangeKind::Headers),
    )
    .await?;
    logs.publish_with_headers(
        &json!({"type": "log", "level": "error", "message": "Payment failed"}),
        headers([("priority", "high"), ("source", "payment-service")]),
    )?;

    for producer in [direct, fanout, topic, logs] {
        producer.close();
    }
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.context("failed to listen for ctrl-c")?;
            info!("received ctrl-c, shutting down");
        }
        _ = terminate => info!("received terminate signal, shutting down"),
    }
    Ok(())
}

async fn wait_for_deliveries(received: &mut mpsc::UnboundedReceiver<&'static str>) -> usize {
    let mut count = 0;
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while count < EXPECTED_DELIVERIES && received.recv().await.is_some() {
            count += 1;
        }
    })
    .await;
    if drained.is_err() {
        warn!(count, expected = EXPECTED_DELIVERIES, "timed out waiting for deliveries");
    }
    count
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = BrokerSettings::parse();
    telemetry::init_tracing(settings.log_format)?;
    if let Some(addr) = settings.metrics_addr {
        telemetry::install_metrics_exporter(addr)?;
    }

    let broker = Arc::new(
        Broker::new(settings.endpoint())
            .with_user(settings.username.clone(), settings.password.clone()),
    );
    let once = settings.once;
    let session = Session::open(Arc::clone(&broker), settings.into_connection_config())
        .await
        .context("failed to open session")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumers = start_consumers(&session, &tx).await?;
    drop(tx);
    publish_test_messages(&session).await?;

    if once {
        let count = wait_for_deliveries(&mut rx).await;
        info!(count, "test messages consumed");
    } else {
        tokio::select! {
            result = shutdown_signal() => result?,
            () = session.closed() => warn!(state = ?session.state(), "session ended"),
        }
    }

    for (mut consumer, handle) in consumers {
        consumer.close();
        match handle.join().await {
            Ok(summary) => info!(queue = %consumer.queue().name, ?summary, "consumer stopped"),
            Err(err) => warn!(queue = %consumer.queue().name, error = %err, "consumer failed"),
        }
    }
    session.close();
    Ok(())
}
