//! # Engine: owns registrations and the joint run/shutdown protocol.
//!
//! The [`Engine`] holds the shared [`Connection`], the registration set, the
//! event bus and the span provider. `consume` starts one [`DispatchLoop`] per
//! registration and acts as the completion barrier for all of them.
//!
//! ## High-level architecture
//! ```text
//! register(handler, options) ──► TransportConfig::from_options ──► connection.new_subscriber
//!                                    ├─ Err ─► SubscriptionRejected ─► EngineError::SubscriptionSetup
//!                                    └─ Ok  ─► Registration appended ─► ConsumerRegistered
//!
//! consume(token):
//!   Registration[0]  Registration[1]  ...  Registration[N-1]
//!        │                 │                      │
//!        └──► DispatchLoop::run(token.child_token())     (one tokio task each)
//!
//!   join handles in registration order ─► results[0..N]
//!        ├─ any Err ─► return the lowest-index Err
//!        └─ none    ─► wait for token.cancelled() ─► Ok(())
//!
//! Event flow:
//!   DispatchLoop / publish ── Event ──► Bus ──► listener ──► SubscriberSet ──► LogWriter, ...
//! ```
//!
//! ## Rules
//! - `consume` waits for **all** loops before reporting, even after a fatal error.
//! - A loop that stopped normally does not end `consume`; only cancellation does.
//! - `register` takes `&mut self`, `consume` takes `&self`: no registration can
//!   be added while consuming. A second `consume` fails with
//!   [`EngineError::AlreadyConsumed`].
//! - `close` must be called by the owner after `consume` returns.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use queuevisor::{Engine, HandlerFn, HandlerError};
//! use queuevisor::transport::memory::MemoryBroker;
//! use queuevisor::transport::options::{consumer_topic_durable, publisher_topic_durable};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     let mut engine = Engine::builder(Arc::new(broker.clone()))
//!         .with_subscribers(vec![])
//!         .build();
//!
//!     let token = CancellationToken::new();
//!     let stop = token.clone();
//!     engine.register(
//!         HandlerFn::arc("orders", move |_ctx, msg| {
//!             let stop = stop.clone();
//!             async move {
//!                 let body: serde_json::Value = msg.decode()?;
//!                 assert_eq!(body["x"], 1);
//!                 stop.cancel();
//!                 Ok::<_, HandlerError>(())
//!             }
//!         }),
//!         consumer_topic_durable("orders.*", "events", "orders", 8),
//!     )?;
//!
//!     // Declare the queue binding up front so the publish below is routed.
//!     broker.declare_exchange("events", queuevisor::transport::ExchangeKind::Topic, true)?;
//!     broker.declare_queue("orders", true)?;
//!     broker.bind("events", "orders", "orders.*")?;
//!
//!     engine.publish(&serde_json::json!({"x": 1}), publisher_topic_durable("orders.created", "events")).await?;
//!     engine.consume(token).await?;
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    config::EngineConfig,
    core::{builder::EngineBuilder, dispatch::DispatchLoop, panic_message, publish, shutdown},
    error::{EngineError, PublishError},
    events::{Bus, Event, EventKind},
    handlers::{HandlerRef, Registration},
    subscribers::SubscriberSet,
    tracer::TracerRef,
    transport::{ConfigOption, Connection, TransportConfig},
};

/// Consumption engine: registrations, dispatch loops, publishing.
pub struct Engine {
    cfg: Arc<EngineConfig>,
    connection: Arc<dyn Connection>,
    tracer: TracerRef,
    bus: Bus,
    registrations: Vec<Registration>,
    started: AtomicBool,
}

impl Engine {
    /// Returns a builder bound to the shared `connection`.
    pub fn builder(connection: Arc<dyn Connection>) -> EngineBuilder {
        EngineBuilder::new(connection)
    }

    pub(crate) fn new_internal(
        cfg: EngineConfig,
        connection: Arc<dyn Connection>,
        tracer: TracerRef,
        bus: Bus,
        subs: Arc<SubscriberSet>,
    ) -> Self {
        let engine = Self {
            cfg: Arc::new(cfg),
            connection,
            tracer,
            bus,
            registrations: Vec::new(),
            started: AtomicBool::new(false),
        };
        engine.subscriber_listener(subs);
        engine
    }

    /// Subscribes to the bus and forwards events to the subscriber set (fire-and-forget).
    fn subscriber_listener(&self, subs: Arc<SubscriberSet>) {
        if subs.is_empty() {
            return;
        }
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match rx.recv().await {
                    Ok(ev) => subs.emit(ev),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Returns the event bus; receivers observe events published after subscribing.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Returns the registrations in registration order.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Registers `handler` for the subscription described by `options`.
    ///
    /// On a transport rejection nothing is appended and
    /// [`EngineError::SubscriptionSetup`] is returned.
    pub fn register<I>(&mut self, handler: HandlerRef, options: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = ConfigOption>,
    {
        let cfg = TransportConfig::from_options(options);
        let name = handler.name().to_string();

        let subscriber = match self.connection.new_subscriber(&cfg) {
            Ok(subscriber) => subscriber,
            Err(source) => {
                self.bus.publish(
                    Event::new(EventKind::SubscriptionRejected)
                        .with_consumer(name.as_str())
                        .with_reason(source.to_string()),
                );
                return Err(EngineError::SubscriptionSetup {
                    consumer: name,
                    source,
                });
            }
        };

        self.registrations
            .push(Registration::new(handler, subscriber, cfg));
        self.bus
            .publish(Event::new(EventKind::ConsumerRegistered).with_consumer(name));
        Ok(())
    }

    /// Runs every registration until `token` is cancelled.
    ///
    /// Waits for all dispatch loops to stop, then returns the error of the
    /// earliest-registered loop that failed. If none failed, waits for
    /// cancellation and returns `Ok(())`.
    ///
    /// The loops are owned by this future: dropping it aborts them.
    pub async fn consume(&self, token: CancellationToken) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyConsumed);
        }

        let mut set = JoinSet::new();
        for (idx, reg) in self.registrations.iter().enumerate() {
            let lp = DispatchLoop::new(
                reg.clone(),
                self.bus.clone(),
                Arc::clone(&self.tracer),
                Arc::clone(&self.cfg),
            );
            let consumer = reg.name().to_string();
            let child = token.child_token();
            set.spawn(async move {
                let res = match AssertUnwindSafe(lp.run(child)).catch_unwind().await {
                    Ok(res) => res,
                    Err(panic) => Err(EngineError::LoopFatal {
                        consumer,
                        reason: format!("dispatch loop panicked: {}", panic_message(&*panic)),
                    }),
                };
                (idx, res)
            });
        }

        // dropping `set` aborts every loop still running
        let mut results: Vec<Result<(), EngineError>> =
            self.registrations.iter().map(|_| Ok(())).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, res)) => results[idx] = res,
                Err(join_err) => warn!(error = %join_err, "dispatch loop task ended abnormally"),
            }
        }

        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err);
        }
        token.cancelled().await;
        Ok(())
    }

    /// Consumes until a termination signal arrives.
    pub async fn run(&self) -> Result<(), EngineError> {
        let token = CancellationToken::new();
        let watcher = shutdown::spawn_signal_watcher(self.bus.clone(), token.clone());
        let res = self.consume(token).await;
        watcher.abort();
        res
    }

    /// Serializes `payload` as JSON and publishes it with a fresh message id.
    ///
    /// Returns the id assigned to the message.
    pub async fn publish<T, I>(&self, payload: &T, options: I) -> Result<String, PublishError>
    where
        T: Serialize + ?Sized,
        I: IntoIterator<Item = ConfigOption>,
    {
        let cfg = TransportConfig::from_options(options);
        publish::publish(self.connection.as_ref(), &self.bus, payload, &cfg).await
    }

    /// Closes the shared connection.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.connection.close().await.map_err(EngineError::Close)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::context::Context;
    use crate::error::{HandlerError, TransportError};
    use crate::handlers::HandlerFn;
    use crate::tracer::{SpanHandle, SpanProvider};
    use crate::transport::memory::MemoryBroker;
    use crate::transport::options::{
        consumer_topic_durable, publisher_topic_durable, with_queue, with_routing_key,
    };
    use crate::transport::{MessageStream, Publisher, QueueConfig, Subscriber, SubscriberRef};

    const WAIT: Duration = Duration::from_secs(2);

    fn engine(connection: Arc<dyn Connection>) -> Engine {
        Engine::builder(connection).with_subscribers(vec![]).build()
    }

    fn queue(name: &str) -> Vec<ConfigOption> {
        vec![with_queue(QueueConfig::durable(name))]
    }

    fn counting(name: &'static str, count: Arc<AtomicUsize>) -> HandlerRef {
        HandlerFn::arc(name, move |_ctx, _msg| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        })
    }

    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    async fn next_of(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
        tokio::time::timeout(WAIT, async {
            loop {
                let ev = rx.recv().await.unwrap();
                if ev.kind == kind {
                    return ev;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_panicking_handler_never_stops_its_neighbour() {
        const N: usize = 5;
        let broker = MemoryBroker::new();
        broker.declare_queue("a", true).unwrap();
        broker.declare_queue("b", true).unwrap();

        let mut engine = engine(Arc::new(broker.clone()));
        let handled = Arc::new(AtomicUsize::new(0));
        engine.register(counting("a", handled.clone()), queue("a")).unwrap();
        engine
            .register(
                HandlerFn::arc("b", |_ctx, _msg| async move {
                    if true {
                        panic!("poison message");
                    }
                    Ok(())
                }),
                queue("b"),
            )
            .unwrap();

        for i in 0..N {
            engine.publish(&i, [with_routing_key("a")]).await.unwrap();
            engine.publish(&i, [with_routing_key("b")]).await.unwrap();
        }

        let engine = Arc::new(engine);
        let mut rx = engine.bus().subscribe();
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            let token = token.clone();
            async move { engine.consume(token).await }
        });

        eventually("all acks", || {
            broker.queue_stats("a").unwrap().acked == N as u64
                && broker.queue_stats("b").unwrap().acked == N as u64
        })
        .await;
        token.cancel();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), N);
        for name in ["a", "b"] {
            let stats = broker.queue_stats(name).unwrap();
            assert_eq!(stats.acked, N as u64);
            assert_eq!(stats.nacked, 0);
            assert_eq!(stats.redelivered, 0);
        }

        let events = drain(&mut rx);
        let faults: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::HandlerPanicked)
            .collect();
        assert_eq!(faults.len(), N);
        assert!(faults.iter().all(|e| e.consumer.as_deref() == Some("b")
            && e.reason.as_deref() == Some("poison message")));
        assert_eq!(
            events.iter().filter(|e| e.kind == EventKind::ConsumerStopped).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_acked_and_loop_continues() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs", true).unwrap();
        let mut engine = engine(Arc::new(broker.clone()));
        engine
            .register(
                HandlerFn::arc("jobs", |_ctx, msg| async move {
                    let n: u32 = msg.decode()?;
                    Err(HandlerError::fail(format!("job {n} failed")))
                }),
                queue("jobs"),
            )
            .unwrap();
        for n in 0..3_u32 {
            engine.publish(&n, [with_routing_key("jobs")]).await.unwrap();
        }

        let engine = Arc::new(engine);
        let mut rx = engine.bus().subscribe();
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            let token = token.clone();
            async move { engine.consume(token).await }
        });

        for n in 0..3 {
            let ev = next_of(&mut rx, EventKind::HandlerFailed).await;
            assert_eq!(ev.reason.as_deref(), Some(format!("handler failed: job {n} failed").as_str()));
        }
        token.cancel();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();

        let stats = broker.queue_stats("jobs").unwrap();
        assert_eq!((stats.acked, stats.nacked, stats.depth), (3, 0, 0));
    }

    #[tokio::test]
    async fn test_malformed_binding_is_rejected_without_registration() {
        let broker = MemoryBroker::new();
        let mut engine = engine(Arc::new(broker));
        let mut rx = engine.bus().subscribe();

        let err = engine
            .register(
                counting("orders", Arc::default()),
                consumer_topic_durable("orders..created", "events", "orders", 4),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::SubscriptionSetup {
                source: TransportError::InvalidConfig { .. },
                ..
            }
        ));
        assert_eq!(err.consumer(), Some("orders"));
        assert!(engine.registrations().is_empty());
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::SubscriptionRejected);
    }

    #[tokio::test]
    async fn test_presets_deliver_exactly_once() {
        let broker = MemoryBroker::new();
        let mut engine = engine(Arc::new(broker.clone()));
        let seen = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        engine
            .register(
                HandlerFn::arc("orders", {
                    let seen = seen.clone();
                    move |_ctx, msg| {
                        let seen = seen.clone();
                        async move {
                            seen.lock().unwrap().push(msg.decode()?);
                            Ok::<_, HandlerError>(())
                        }
                    }
                }),
                consumer_topic_durable("orders.*", "events", "orders", 4),
            )
            .unwrap();
        assert_eq!(engine.registrations().len(), 1);
        assert_eq!(engine.registrations()[0].name(), "orders");

        let engine = Arc::new(engine);
        let mut rx = engine.bus().subscribe();
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            let token = token.clone();
            async move { engine.consume(token).await }
        });
        next_of(&mut rx, EventKind::ConsumerActive).await;

        let id = engine
            .publish(
                &serde_json::json!({"x": 1}),
                publisher_topic_durable("orders.created", "events"),
            )
            .await
            .unwrap();

        let handled = next_of(&mut rx, EventKind::MessageHandled).await;
        assert_eq!(handled.message.as_deref(), Some(id.as_str()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({"x": 1})]);
        let stats = broker.queue_stats("orders").unwrap();
        assert_eq!((stats.enqueued, stats.delivered, stats.acked), (1, 1, 1));
        assert_eq!(broker.open_publishers(), 0);
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize"))
        }
    }

    #[tokio::test]
    async fn test_unserializable_payload_never_reaches_transport() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs", true).unwrap();
        let engine = engine(Arc::new(broker.clone()));

        let err = engine
            .publish(&Unserializable, [with_routing_key("jobs")])
            .await
            .unwrap_err();

        assert_eq!(err.as_label(), "publish_serialization");
        assert!(err.to_string().contains("cannot serialize"));
        assert_eq!(broker.open_publishers(), 0);
        assert_eq!(broker.queue_stats("jobs").unwrap().enqueued, 0);
    }

    #[tokio::test]
    async fn test_publisher_released_on_success_and_failure() {
        let broker = MemoryBroker::new();
        let engine = engine(Arc::new(broker.clone()));
        let mut rx = engine.bus().subscribe();

        engine
            .publish(&"ok", publisher_topic_durable("a.b", "events"))
            .await
            .unwrap();
        assert_eq!(broker.open_publishers(), 0);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::MessagePublished);

        broker.fail_confirms(Some("nacked by broker"));
        let err = engine
            .publish(&"nope", publisher_topic_durable("a.b", "events"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Publish(TransportError::Rejected { .. })
        ));
        assert_eq!(broker.open_publishers(), 0);

        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::PublishFailed);
        assert!(failed.message.is_some());

        let err = engine.publish(&"nowhere", []).await.unwrap_err();
        assert_eq!(err.as_label(), "publish_publisher");
        assert_eq!(broker.open_publishers(), 0);
    }

    #[tokio::test]
    async fn test_no_pull_after_cancellation() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs", true).unwrap();
        let mut engine = engine(Arc::new(broker.clone()));
        let token = CancellationToken::new();
        let handled = Arc::new(AtomicUsize::new(0));

        engine
            .register(
                HandlerFn::arc("jobs", {
                    let handled = handled.clone();
                    let root = token.clone();
                    move |_ctx, _msg| {
                        let handled = handled.clone();
                        let root = root.clone();
                        async move {
                            handled.fetch_add(1, Ordering::SeqCst);
                            root.cancel();
                            Ok::<_, HandlerError>(())
                        }
                    }
                }),
                vec![
                    with_queue(QueueConfig::durable("jobs")),
                    crate::transport::options::with_prefetch(1),
                ],
            )
            .unwrap();
        for i in 0..5 {
            engine.publish(&i, [with_routing_key("jobs")]).await.unwrap();
        }

        tokio::time::timeout(WAIT, engine.consume(token))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        eventually("requeue of unpulled messages", || {
            broker.queue_stats("jobs").unwrap().depth == 4
        })
        .await;
        assert_eq!(broker.queue_stats("jobs").unwrap().acked, 1);
    }

    #[tokio::test]
    async fn test_handler_cancelling_its_context_keeps_loop_running() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs", true).unwrap();
        let mut engine = engine(Arc::new(broker.clone()));
        let handled = Arc::new(AtomicUsize::new(0));

        engine
            .register(
                HandlerFn::arc("jobs", {
                    let handled = handled.clone();
                    move |ctx: Context, _msg| {
                        let handled = handled.clone();
                        async move {
                            ctx.token().cancel();
                            assert!(ctx.is_cancelled());
                            handled.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, HandlerError>(())
                        }
                    }
                }),
                queue("jobs"),
            )
            .unwrap();
        for i in 0..3 {
            engine.publish(&i, [with_routing_key("jobs")]).await.unwrap();
        }

        let token = CancellationToken::new();
        let run = engine.consume(token.clone());
        let stop = async {
            eventually("every message", || handled.load(Ordering::SeqCst) == 3).await;
            token.cancel();
        };
        let (res, ()) = tokio::join!(run, stop);
        res.unwrap();

        let stats = broker.queue_stats("jobs").unwrap();
        assert_eq!((stats.acked, stats.depth), (3, 0));
    }

    #[tokio::test]
    async fn test_dropped_consume_stops_its_loops() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs", true).unwrap();
        let mut engine = engine(Arc::new(broker.clone()));
        let handled = Arc::new(AtomicUsize::new(0));
        engine.register(counting("jobs", handled.clone()), queue("jobs")).unwrap();

        let token = CancellationToken::new();
        let res = tokio::time::timeout(Duration::from_millis(50), engine.consume(token.clone())).await;
        assert!(res.is_err());
        assert!(!token.is_cancelled());

        for i in 0..3 {
            engine.publish(&i, [with_routing_key("jobs")]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handled.load(Ordering::SeqCst), 0);
        let stats = broker.queue_stats("jobs").unwrap();
        assert_eq!((stats.acked, stats.depth), (0, 3));
    }

    #[tokio::test]
    async fn test_fatal_loop_waits_for_healthy_neighbour() {
        let mut engine = engine(Arc::new(Scripted));
        engine.register(counting("idle", Arc::default()), queue("idle")).unwrap();
        engine.register(counting("fast", Arc::default()), queue("fast")).unwrap();
        let mut rx = engine.bus().subscribe();

        let token = CancellationToken::new();
        let run = engine.consume(token.clone());
        tokio::pin!(run);

        let dead = tokio::select! {
            ev = next_of(&mut rx, EventKind::ConsumerDead) => ev,
            _ = &mut run => panic!("consume returned while a loop was healthy"),
        };
        assert_eq!(dead.consumer.as_deref(), Some("fast"));
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut run).await.is_err());

        token.cancel();
        let err = tokio::time::timeout(WAIT, run).await.unwrap().unwrap_err();
        match err {
            EngineError::LoopFatal { consumer, reason } => {
                assert_eq!(consumer, "fast");
                assert_eq!(reason, "rejected by broker: fast failure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stopped_loops_wait_for_cancellation() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs", true).unwrap();
        let mut engine = engine(Arc::new(broker.clone()));
        engine.register(counting("jobs", Arc::default()), queue("jobs")).unwrap();
        let mut rx = engine.bus().subscribe();

        let token = CancellationToken::new();
        let run = engine.consume(token.clone());
        tokio::pin!(run);

        let stopped = tokio::select! {
            ev = async {
                next_of(&mut rx, EventKind::ConsumerActive).await;
                broker.close().await.unwrap();
                next_of(&mut rx, EventKind::ConsumerStopped).await
            } => ev,
            _ = &mut run => panic!("consume returned before cancellation"),
        };
        assert_eq!(stopped.reason.as_deref(), Some("stream_closed"));
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut run).await.is_err());

        token.cancel();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    }

    /// Subscriber that fails (or panics) after a delay.
    struct Failing {
        delay: Duration,
        panic: bool,
        reason: &'static str,
    }

    #[async_trait]
    impl Subscriber for Failing {
        async fn subscribe(&self, _token: CancellationToken) -> Result<MessageStream, TransportError> {
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("{}", self.reason);
            }
            Err(TransportError::Rejected {
                reason: self.reason.to_string(),
            })
        }
    }

    /// Subscriber whose stream stays open and empty until cancellation.
    struct Idle;

    #[async_trait]
    impl Subscriber for Idle {
        async fn subscribe(&self, token: CancellationToken) -> Result<MessageStream, TransportError> {
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            tokio::spawn(async move {
                token.cancelled().await;
                drop(tx);
            });
            Ok(rx)
        }
    }

    /// Connection whose subscribers are chosen by queue name.
    struct Scripted;

    #[async_trait]
    impl Connection for Scripted {
        fn new_subscriber(&self, cfg: &TransportConfig) -> Result<SubscriberRef, TransportError> {
            let sub = match cfg.queue_name() {
                "idle" => return Ok(Arc::new(Idle)),
                "slow" => Failing {
                    delay: Duration::from_millis(80),
                    panic: false,
                    reason: "slow failure",
                },
                "fast" => Failing {
                    delay: Duration::ZERO,
                    panic: false,
                    reason: "fast failure",
                },
                _ => Failing {
                    delay: Duration::from_millis(10),
                    panic: true,
                    reason: "subscribe exploded",
                },
            };
            Ok(Arc::new(sub))
        }

        fn new_publisher(&self, _cfg: &TransportConfig) -> Result<Box<dyn Publisher>, TransportError> {
            Err(TransportError::Closed)
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_earliest_registered_fatal_error_wins() {
        let mut engine = engine(Arc::new(Scripted));
        engine.register(counting("slow", Arc::default()), queue("slow")).unwrap();
        engine.register(counting("fast", Arc::default()), queue("fast")).unwrap();

        let err = tokio::time::timeout(WAIT, engine.consume(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        match err {
            EngineError::LoopFatal { consumer, reason } => {
                assert_eq!(consumer, "slow");
                assert_eq!(reason, "rejected by broker: slow failure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_panic_is_recovered_as_fatal() {
        let mut engine = engine(Arc::new(Scripted));
        engine.register(counting("weird", Arc::default()), queue("weird")).unwrap();
        let mut rx = engine.bus().subscribe();

        let err = tokio::time::timeout(WAIT, engine.consume(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.as_label(), "engine_loop_fatal");
        assert!(err.to_string().contains("subscribe exploded"));
        assert_eq!(next_of(&mut rx, EventKind::ConsumerDead).await.consumer.as_deref(), Some("weird"));
    }

    #[tokio::test]
    async fn test_consume_twice_and_close_twice() {
        let broker = MemoryBroker::new();
        let engine = engine(Arc::new(broker.clone()));
        let token = CancellationToken::new();
        token.cancel();

        engine.consume(token.clone()).await.unwrap();
        assert!(matches!(
            engine.consume(token).await,
            Err(EngineError::AlreadyConsumed)
        ));

        engine.close().await.unwrap();
        assert!(broker.is_closed());
        assert!(matches!(
            engine.close().await,
            Err(EngineError::Close(TransportError::Closed))
        ));
    }

    #[derive(Default)]
    struct RecordingTracer {
        spans: Arc<Mutex<Vec<SpanRecord>>>,
    }

    #[derive(Clone, Debug, Default)]
    struct SpanRecord {
        name: String,
        error: Option<String>,
        outcome: Option<String>,
        ended: bool,
    }

    struct RecordingSpan {
        spans: Arc<Mutex<Vec<SpanRecord>>>,
        index: usize,
    }

    impl SpanProvider for RecordingTracer {
        fn start_span(&self, parent: &Context, name: &str) -> (Context, Box<dyn SpanHandle>) {
            let mut spans = self.spans.lock().unwrap();
            spans.push(SpanRecord {
                name: name.to_string(),
                ..SpanRecord::default()
            });
            let span = RecordingSpan {
                spans: self.spans.clone(),
                index: spans.len() - 1,
            };
            (parent.clone(), Box::new(span))
        }
    }

    impl SpanHandle for RecordingSpan {
        fn set_attribute(&mut self, key: &'static str, value: &str) {
            if key == crate::tracer::attributes::OUTCOME {
                self.spans.lock().unwrap()[self.index].outcome = Some(value.to_string());
            }
        }

        fn record_error(&mut self, error: &str) {
            self.spans.lock().unwrap()[self.index].error = Some(error.to_string());
        }

        fn end(self: Box<Self>) {
            self.spans.lock().unwrap()[self.index].ended = true;
        }
    }

    #[tokio::test]
    async fn test_every_invocation_gets_a_closed_span() {
        let broker = MemoryBroker::new();
        broker.declare_queue("mixed", true).unwrap();
        let tracer = RecordingTracer::default();
        let spans = tracer.spans.clone();

        let mut engine = Engine::builder(Arc::new(broker.clone()))
            .with_tracer(Arc::new(tracer))
            .with_subscribers(vec![])
            .build();
        engine
            .register(
                HandlerFn::arc("mixed", |_ctx, msg| async move {
                    match msg.decode::<String>()?.as_str() {
                        "ok" => Ok(()),
                        "fail" => Err(HandlerError::fail("nope")),
                        _ => panic!("kaboom"),
                    }
                }),
                queue("mixed"),
            )
            .unwrap();
        for body in ["ok", "fail", "panic"] {
            engine.publish(body, [with_routing_key("mixed")]).await.unwrap();
        }

        let token = CancellationToken::new();
        let run = engine.consume(token.clone());
        let stop = async {
            eventually("three acks", || broker.queue_stats("mixed").unwrap().acked == 3).await;
            token.cancel();
        };
        let (res, ()) = tokio::join!(run, stop);
        res.unwrap();

        let spans = spans.lock().unwrap().clone();
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.ended && s.name == "[consumer] mixed"));
        assert_eq!(spans[0].error, None);
        assert_eq!(spans[0].outcome.as_deref(), Some("completed"));
        assert_eq!(spans[1].error.as_deref(), Some("handler failed: nope"));
        assert_eq!(spans[2].error.as_deref(), Some("kaboom"));
        assert_eq!(spans[2].outcome.as_deref(), Some("panicked"));
    }
}
