//! # Example: two consumers over the in-memory broker
//!
//! Demonstrates:
//! - registering handlers with the durable topic presets
//! - a handler that panics on every message without stalling its queue
//! - `LogWriter` rendering engine events through `tracing-subscriber`
//! - per-message spans with [`TracingSpanProvider`]
//!
//! ## Run
//! ```bash
//! RUST_LOG=debug cargo run --example memory_pubsub
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use queuevisor::transport::ExchangeKind;
use queuevisor::transport::memory::MemoryBroker;
use queuevisor::transport::options::{consumer_topic_durable, publisher_topic_durable};
use queuevisor::{ConnectionConfig, Engine, HandlerError, HandlerFn, TracingSpanProvider};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
    amount_cents: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let target = ConnectionConfig::from_env()?;
    tracing::info!(
        host = %target.host,
        port = target.port,
        vhost = %target.vhost,
        "no AMQP client configured, standing in with the in-memory broker"
    );

    let broker = MemoryBroker::new();
    broker.declare_exchange("events", ExchangeKind::Topic, true)?;
    for (queue, key) in [("billing", "orders.*"), ("audit", "orders.#")] {
        broker.declare_queue(queue, true)?;
        broker.bind("events", queue, key)?;
    }

    let mut engine = Engine::builder(Arc::new(broker.clone()))
        .with_tracer(Arc::new(TracingSpanProvider::new()))
        .build();

    engine.register(
        HandlerFn::arc("billing", |_ctx, msg| async move {
            let order: OrderCreated = msg.decode()?;
            if order.amount_cents == 0 {
                return Err(HandlerError::fail(format!("order {} has no amount", order.id)));
            }
            tracing::info!(order = order.id, amount = order.amount_cents, "charged");
            Ok(())
        }),
        consumer_topic_durable("orders.*", "events", "billing", 8),
    )?;
    engine.register(
        HandlerFn::arc("audit", |_ctx, msg| async move {
            if msg.redelivered() {
                return Ok(());
            }
            panic!("audit store unavailable for {}", msg.id());
        }),
        consumer_topic_durable("orders.#", "events", "audit", 8),
    )?;

    for (id, amount_cents) in [(1, 1250), (2, 0), (3, 990)] {
        let msg_id = engine
            .publish(
                &OrderCreated { id, amount_cents },
                publisher_topic_durable("orders.created", "events"),
            )
            .await?;
        tracing::info!(order = id, message = %msg_id, "published");
    }

    let engine = Arc::new(engine);
    let token = CancellationToken::new();
    let runner = tokio::spawn({
        let engine = Arc::clone(&engine);
        let token = token.clone();
        async move { engine.consume(token).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();
    runner.await??;

    for queue in ["billing", "audit"] {
        if let Some(stats) = broker.queue_stats(queue) {
            println!(
                "{queue}: acked={} redelivered={} depth={}",
                stats.acked, stats.redelivered, stats.depth
            );
        }
    }

    engine.close().await?;
    // let the log writer drain
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
