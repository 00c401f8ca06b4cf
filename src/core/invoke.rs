//! # Single point of handler invocation.
//!
//! [`invoke`] runs one handler on one message inside a fault boundary and
//! returns a tagged [`Outcome`]. A panic raised while building or polling the
//! handler future is recovered here and becomes [`Outcome::Faulted`].
//!
//! ## Span lifecycle
//! ```text
//! tracer enabled?
//!   ├─ no  ──► handler(run ctx)
//!   └─ yes ──► start_span(ctx, "{prefix}{handler}") ─► set message_id, consumer
//!                  └─► handler(span ctx).instrument(span)
//!                          └─► record_error (Failed | Faulted) ─► outcome ─► end()
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::HandlerError;
use crate::events::EventKind;
use crate::handlers::Handler;
use crate::tracer::{SpanProvider, attributes};
use crate::transport::Message;

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler returned `Ok(())`.
    Completed,
    /// The handler returned an error.
    Failed(HandlerError),
    /// The handler panicked; carries the recovered panic message.
    Faulted(String),
}

impl Outcome {
    /// Returns a short stable label for spans and logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::Faulted(_) => "panicked",
        }
    }

    /// Error text of a failed or faulted invocation.
    pub fn error(&self) -> Option<String> {
        match self {
            Outcome::Completed => None,
            Outcome::Failed(e) => Some(e.to_string()),
            Outcome::Faulted(info) => Some(info.clone()),
        }
    }

    /// Event kind published for this outcome.
    pub fn event_kind(&self) -> EventKind {
        match self {
            Outcome::Completed => EventKind::MessageHandled,
            Outcome::Failed(_) => EventKind::HandlerFailed,
            Outcome::Faulted(_) => EventKind::HandlerPanicked,
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `handler` on `msg` and converts every result, panics included, into an [`Outcome`].
pub(crate) async fn invoke(
    handler: &dyn Handler,
    ctx: &Context,
    msg: Arc<Message>,
    tracer: &dyn SpanProvider,
    cfg: &EngineConfig,
) -> Outcome {
    let (hctx, mut span) = if tracer.is_enabled() {
        let (derived, mut span) = tracer.start_span(ctx, &cfg.span_name(handler.name()));
        span.set_attribute(attributes::MESSAGE_ID, msg.id());
        span.set_attribute(attributes::CONSUMER, handler.name());
        (derived, Some(span))
    } else {
        (ctx.clone(), None)
    };

    let instrument = hctx.span().clone();
    let call = async { handler.handle(hctx, msg).await };
    let outcome = match AssertUnwindSafe(call.instrument(instrument))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Outcome::Completed,
        Ok(Err(e)) => Outcome::Failed(e),
        Err(panic) => Outcome::Faulted(panic_message(&*panic)),
    };

    if let Some(mut span) = span.take() {
        if let Some(err) = outcome.error() {
            span.record_error(&err);
            span.set_attribute(attributes::ERROR_MESSAGE, &err);
        }
        span.set_attribute(attributes::OUTCOME, outcome.as_label());
        span.end();
    }
    outcome
}
