//! # Dispatch loop: one per registration.
//!
//! Pulls messages from a single subscription and hands them, one at a time,
//! to the bound handler.
//!
//! ## State machine
//! ```text
//! Idle ─► Subscribing ─┬─► Active ─► Draining ─► Stopped      (cancelled | stream_closed → Ok)
//!                      └─────────────────────────► Stopped    (subscribe error/panic → LoopFatal)
//! ```
//!
//! ## Rules
//! - Subscribing is the only step that can end the loop with an error.
//! - Every pulled message is acknowledged after its invocation, whatever the
//!   [`Outcome`](crate::Outcome). Messages are never negatively acknowledged.
//! - Handling is sequential: the next message is pulled only after the
//!   previous invocation and its ack are done.
//! - Cancellation is checked before every pull and wins over a ready message.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::core::invoke::{invoke, panic_message};
use crate::error::EngineError;
use crate::events::{Bus, Event, EventKind};
use crate::handlers::Registration;
use crate::tracer::TracerRef;
use crate::transport::{Message, MessageStream};

/// Lifecycle state of a dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Subscribing,
    Active,
    Draining,
    Stopped,
}

/// Why an active loop stopped pulling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Cancelled,
    StreamClosed,
}

impl StopCause {
    fn as_str(self) -> &'static str {
        match self {
            StopCause::Cancelled => "cancelled",
            StopCause::StreamClosed => "stream_closed",
        }
    }
}

/// Drives one [`Registration`] until cancellation, end of stream, or a fatal subscribe error.
pub(crate) struct DispatchLoop {
    reg: Registration,
    bus: Bus,
    tracer: TracerRef,
    cfg: Arc<EngineConfig>,
    state: LoopState,
}

impl DispatchLoop {
    pub(crate) fn new(
        reg: Registration,
        bus: Bus,
        tracer: TracerRef,
        cfg: Arc<EngineConfig>,
    ) -> Self {
        Self {
            reg,
            bus,
            tracer,
            cfg,
            state: LoopState::Idle,
        }
    }

    /// Runs the loop to completion.
    pub(crate) async fn run(mut self, token: CancellationToken) -> Result<(), EngineError> {
        let ctx = Context::new(token);

        self.transition(LoopState::Subscribing);
        self.bus.publish(self.event(EventKind::ConsumerSubscribing));

        let mut stream = match self.subscribe(&ctx).await {
            Ok(stream) => stream,
            Err(reason) => {
                self.transition(LoopState::Stopped);
                self.bus
                    .publish(self.event(EventKind::ConsumerDead).with_reason(reason.as_str()));
                return Err(EngineError::LoopFatal {
                    consumer: self.reg.name().to_string(),
                    reason,
                });
            }
        };

        self.transition(LoopState::Active);
        self.bus.publish(self.event(EventKind::ConsumerActive));

        let cause = loop {
            let msg = tokio::select! {
                biased;
                _ = ctx.cancelled() => break StopCause::Cancelled,
                next = stream.recv() => match next {
                    Some(msg) => msg,
                    None => break StopCause::StreamClosed,
                },
            };
            self.dispatch(&ctx, msg).await;
        };

        self.transition(LoopState::Draining);
        drop(stream);

        self.transition(LoopState::Stopped);
        self.bus
            .publish(self.event(EventKind::ConsumerStopped).with_reason(cause.as_str()));
        Ok(())
    }

    /// Starts the subscription inside a fault boundary.
    async fn subscribe(&self, ctx: &Context) -> Result<MessageStream, String> {
        let subscriber = Arc::clone(self.reg.subscriber());
        let token = ctx.token().clone();
        let fut = async move { subscriber.subscribe(token).await };

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("subscribe panicked: {}", panic_message(&*panic))),
        }
    }

    /// Invokes the handler under a child context, then acknowledges the message.
    ///
    /// A handler cancelling its own token only affects that invocation.
    async fn dispatch(&self, ctx: &Context, msg: Message) {
        let msg = Arc::new(msg);
        let outcome = invoke(
            self.reg.handler().as_ref(),
            &ctx.child(),
            Arc::clone(&msg),
            self.tracer.as_ref(),
            &self.cfg,
        )
        .await;

        msg.ack();

        let mut ev = self.event(outcome.event_kind()).with_message(msg.id());
        if let Some(err) = outcome.error() {
            ev = ev.with_reason(err);
        }
        self.bus.publish(ev);
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind).with_consumer(self.reg.name())
    }

    fn transition(&mut self, next: LoopState) {
        tracing::trace!(
            consumer = self.reg.name(),
            from = ?self.state,
            to = ?next,
            "dispatch loop transition"
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::HandlerError;
    use crate::handlers::HandlerFn;
    use crate::tracer::NoopTracer;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::options::{with_queue, with_routing_key};
    use crate::transport::{Connection, QueueConfig, TransportConfig};

    fn registration(broker: &MemoryBroker, queue: &str) -> Registration {
        let cfg = TransportConfig::from_options([with_queue(QueueConfig::durable(queue))]);
        let handler = HandlerFn::arc("jobs", |_ctx, msg| async move {
            match msg.payload() {
                b"bad" => Err(HandlerError::fail("bad payload")),
                _ => Ok(()),
            }
        });
        Registration::new(handler, broker.new_subscriber(&cfg).unwrap(), cfg)
    }

    async fn send(broker: &MemoryBroker, queue: &str, body: &[u8]) {
        let publisher = broker
            .new_publisher(&TransportConfig::from_options([with_routing_key(queue)]))
            .unwrap();
        publisher
            .publish(crate::transport::OutgoingMessage {
                id: uuid::Uuid::new_v4().to_string(),
                payload: body.to_vec(),
            })
            .await
            .unwrap();
        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_close_stops_loop_without_error() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs", true).unwrap();
        send(&broker, "jobs", b"ok").await;
        send(&broker, "jobs", b"bad").await;

        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let lp = DispatchLoop::new(
            registration(&broker, "jobs"),
            bus.clone(),
            Arc::new(NoopTracer),
            Arc::new(EngineConfig::default()),
        );
        let handle = tokio::spawn(lp.run(CancellationToken::new()));

        let mut handled = 0;
        while handled < 2 {
            let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(ev.kind, EventKind::MessageHandled | EventKind::HandlerFailed) {
                handled += 1;
            }
        }
        broker.close().await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());

        let stats = broker.queue_stats("jobs").unwrap();
        assert_eq!((stats.acked, stats.nacked, stats.redelivered), (2, 0, 0));

        let stopped = loop {
            let ev = rx.recv().await.unwrap();
            if ev.kind == EventKind::ConsumerStopped {
                break ev;
            }
        };
        assert_eq!(stopped.reason.as_deref(), Some("stream_closed"));
    }

    #[tokio::test]
    async fn test_subscribe_error_is_fatal() {
        let broker = MemoryBroker::new();
        let reg = registration(&broker, "jobs");
        broker.close().await.unwrap();

        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let lp = DispatchLoop::new(
            reg,
            bus.clone(),
            Arc::new(NoopTracer),
            Arc::new(EngineConfig::default()),
        );

        let err = lp.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.as_label(), "engine_loop_fatal");
        assert_eq!(err.consumer(), Some("jobs"));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ConsumerSubscribing);
        let dead = rx.recv().await.unwrap();
        assert_eq!(dead.kind, EventKind::ConsumerDead);
        assert_eq!(dead.reason.as_deref(), Some("connection closed"));
    }
}
