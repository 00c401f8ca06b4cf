//! # Lifecycle events emitted by the engine and its dispatch loops.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Registration events**: a handler was (or could not be) registered
//! - **Loop events**: dispatch loop state changes (subscribing, active, stopped, dead)
//! - **Message events**: per-message outcomes (handled, failed, panicked)
//! - **Runtime events**: publishing, shutdown, subscriber health
//!
//! The [`Event`] struct carries additional metadata such as timestamps, consumer
//! name, message id, and reasons.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use queuevisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::HandlerFailed)
//!     .with_consumer("orders")
//!     .with_message("m-1")
//!     .with_reason("boom");
//!
//! assert_eq!(ev.kind, EventKind::HandlerFailed);
//! assert_eq!(ev.consumer.as_deref(), Some("orders"));
//! assert_eq!(ev.reason.as_deref(), Some("boom"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Registration events ===
    /// A handler was registered.
    ///
    /// Sets:
    /// - `consumer`: handler name
    ConsumerRegistered,

    /// The transport refused to build a subscription.
    ///
    /// Sets:
    /// - `consumer`: handler name
    /// - `reason`: transport error
    SubscriptionRejected,

    // === Loop events ===
    /// A dispatch loop is subscribing.
    ///
    /// Sets:
    /// - `consumer`: handler name
    ConsumerSubscribing,

    /// A dispatch loop is active and pulling messages.
    ///
    /// Sets:
    /// - `consumer`: handler name
    ConsumerActive,

    /// A dispatch loop stopped normally.
    ///
    /// Sets:
    /// - `consumer`: handler name
    /// - `reason`: `"cancelled"` or `"stream_closed"`
    ConsumerStopped,

    /// A dispatch loop stopped fatally (subscribe failed or panicked).
    ///
    /// Sets:
    /// - `consumer`: handler name
    /// - `reason`: fatal error message
    ConsumerDead,

    // === Message events ===
    /// A handler completed and the message was acknowledged.
    ///
    /// Sets:
    /// - `consumer`: handler name
    /// - `message`: message id
    MessageHandled,

    /// A handler returned an error; the message was still acknowledged.
    ///
    /// Sets:
    /// - `consumer`: handler name
    /// - `message`: message id
    /// - `reason`: handler error
    HandlerFailed,

    /// A handler panicked; the panic was recovered and the message acknowledged.
    ///
    /// Sets:
    /// - `consumer`: handler name
    /// - `message`: message id
    /// - `reason`: panic message
    HandlerPanicked,

    // === Runtime events ===
    /// A message was published.
    ///
    /// Sets:
    /// - `message`: message id
    MessagePublished,

    /// Publishing failed.
    ///
    /// Sets:
    /// - `message`: message id (if one was assigned)
    /// - `reason`: publish error
    PublishFailed,

    /// Shutdown requested (OS signal observed).
    ShutdownRequested,

    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `consumer`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `consumer`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Handler (or subscriber) name, if applicable.
    pub consumer: Option<Arc<str>>,
    /// Message id, if applicable.
    pub message: Option<Arc<str>>,
    /// Human-readable reason (errors, panic info, stop cause).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            consumer: None,
            message: None,
            reason: None,
        }
    }

    /// Attaches a consumer name.
    #[inline]
    pub fn with_consumer(mut self, consumer: impl Into<Arc<str>>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Attaches a message id.
    #[inline]
    pub fn with_message(mut self, id: impl Into<Arc<str>>) -> Self {
        self.message = Some(id.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_consumer(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_consumer(subscriber)
            .with_reason(info)
    }

    /// Returns true for per-message fault events (`HandlerFailed`, `HandlerPanicked`).
    #[inline]
    pub fn is_handler_fault(&self) -> bool {
        matches!(
            self.kind,
            EventKind::HandlerFailed | EventKind::HandlerPanicked
        )
    }
}
