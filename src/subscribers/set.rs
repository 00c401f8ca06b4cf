//! # Fan-out of events to sinks.
//!
//! ```text
//! emit(ev) ──try_send──► lane "log-writer" ──► worker ──► on_event(&ev)
//!          ──try_send──► lane "metrics"    ──► worker ──► on_event(&ev)
//!                          │ full/closed            └─ panic ─► SubscriberPanicked
//!                          └─► SubscriberOverflow
//! ```
//!
//! `emit` never waits. Each lane is FIFO; there is no ordering across lanes.
//! A sink that panics while holding a lock may leave its own state
//! inconsistent (the worker runs it under `AssertUnwindSafe`).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::core::panic_message;
use crate::events::{Bus, Event, EventKind};
use crate::subscribers::Subscribe;

/// Queue feeding one sink.
struct Lane {
    name: &'static str,
    tx: mpsc::Sender<Arc<Event>>,
}

/// Delivers events to a fixed set of sinks.
pub struct SubscriberSet {
    lanes: Vec<Lane>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Spawns one worker per sink. Must be called within a Tokio runtime.
    ///
    /// `bus` receives the overflow and panic reports.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let (lanes, workers): (Vec<Lane>, Vec<JoinHandle<()>>) = sinks
            .into_iter()
            .map(|sink| {
                let (tx, rx) = mpsc::channel(sink.queue_capacity().max(1));
                let lane = Lane {
                    name: sink.name(),
                    tx,
                };
                (lane, tokio::spawn(drive(sink, rx, bus.clone())))
            })
            .unzip();
        Self {
            lanes,
            workers,
            bus,
        }
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    /// Returns true when there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Queues `event` for every sink.
    ///
    /// A dropped `SubscriberOverflow` event is not reported again.
    pub fn emit(&self, event: Event) {
        let report = event.kind != EventKind::SubscriberOverflow;
        let event = Arc::new(event);

        for lane in &self.lanes {
            let reason = match lane.tx.try_send(Arc::clone(&event)) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => "full",
                Err(TrySendError::Closed(_)) => "closed",
            };
            if report {
                self.bus.publish(Event::subscriber_overflow(lane.name, reason));
            }
        }
    }

    /// Closes every lane and waits until the workers have drained them.
    pub async fn shutdown(self) {
        drop(self.lanes);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn drive(sink: Arc<dyn Subscribe>, mut rx: mpsc::Receiver<Arc<Event>>, bus: Bus) {
    while let Some(ev) = rx.recv().await {
        let delivered = AssertUnwindSafe(sink.on_event(&ev)).catch_unwind().await;
        if let Err(panic) = delivered {
            bus.publish(Event::subscriber_panicked(sink.name(), panic_message(&*panic)));
        }
    }
}
