//! # LogWriter: structured log sink for engine events.
//!
//! Renders every [`Event`] through the `tracing` crate. Faults are logged at
//! `error`/`warn`, lifecycle transitions at `info`, per-message successes at
//! `debug`.
//!
//! ## Example output (fmt subscriber)
//! ```text
//! INFO  queuevisor: consumer subscribing consumer="orders"
//! INFO  queuevisor: consumer active consumer="orders"
//! ERROR queuevisor: handler panicked, message acknowledged consumer="audit" message="6f1c…" reason="boom"
//! INFO  queuevisor: consumer stopped consumer="orders" reason="cancelled"
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let consumer = e.consumer.as_deref().unwrap_or("");
        let message = e.message.as_deref().unwrap_or("");
        let reason = e.reason.as_deref().unwrap_or("");

        match e.kind {
            EventKind::ConsumerRegistered => info!(consumer, "consumer registered"),
            EventKind::SubscriptionRejected => {
                error!(consumer, reason, "failed to subscribe to queue")
            }
            EventKind::ConsumerSubscribing => info!(consumer, "consumer subscribing"),
            EventKind::ConsumerActive => info!(consumer, "consumer active"),
            EventKind::ConsumerStopped => info!(consumer, reason, "consumer stopped"),
            EventKind::ConsumerDead => error!(consumer, reason, "consumer stopped fatally"),
            EventKind::MessageHandled => debug!(consumer, message, "message handled"),
            EventKind::HandlerFailed => {
                warn!(consumer, message, reason, "error handling message, message acknowledged")
            }
            EventKind::HandlerPanicked => {
                error!(consumer, message, reason, "handler panicked, message acknowledged")
            }
            EventKind::MessagePublished => debug!(message, "message published"),
            EventKind::PublishFailed => error!(message, reason, "publish failed"),
            EventKind::ShutdownRequested => info!("shutdown requested"),
            EventKind::SubscriberOverflow => {
                warn!(subscriber = consumer, reason, "subscriber dropped event")
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = consumer, reason, "subscriber panicked")
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
