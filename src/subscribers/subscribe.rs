//! # Event sinks.
//!
//! Implement [`Subscribe`] to receive engine events: consumer lifecycle,
//! per-message outcomes, publish results.
//!
//! A sink is driven by its own worker with a private bounded queue, so a slow
//! or panicking sink never delays a dispatch loop or another sink. When the
//! queue is full the event is dropped for that sink and reported as
//! `EventKind::SubscriberOverflow`; a panic is reported as
//! `EventKind::SubscriberPanicked` and the worker keeps going.
//!
//! ## Example
//! ```rust
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use async_trait::async_trait;
//! use queuevisor::{Event, EventKind, Subscribe};
//!
//! #[derive(Default)]
//! struct FaultCounter(AtomicU64);
//!
//! #[async_trait]
//! impl Subscribe for FaultCounter {
//!     async fn on_event(&self, ev: &Event) {
//!         if ev.is_handler_fault() || ev.kind == EventKind::ConsumerDead {
//!             self.0.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "fault-counter" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Receiver of engine events.
///
/// `on_event` should not block the executor and should not panic; panics are
/// contained but the event is lost for this sink.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles one event. Events arrive in publish order for a given sink.
    async fn on_event(&self, event: &Event);

    /// Name reported in overflow and panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Capacity of this sink's queue (values below 1 are raised to 1).
    fn queue_capacity(&self) -> usize {
        1024
    }
}
