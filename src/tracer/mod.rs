//! # Span providers for per-message tracing.
//!
//! The engine opens one span per handler invocation through an injected
//! [`SpanProvider`]. There is no process-wide tracer: the provider is passed
//! to the engine builder and shared with every dispatch loop.
//!
//! ## Contract
//! ```text
//! start_span(ctx, name) ──► (derived ctx, SpanHandle)
//!                                 │
//!       handler(derived ctx) ─────┤
//!                                 ├─► set_attribute(key, value)
//!                                 ├─► record_error(msg)   (failure or recovered panic)
//!                                 └─► end()               (always, exactly once)
//! ```
//!
//! ## Providers
//! - [`NoopTracer`]: disabled; the loop passes the run context through untouched.
//! - [`TracingSpanProvider`]: backs spans with the `tracing` crate.

mod tracing_provider;

use std::sync::Arc;

use crate::context::Context;

pub use tracing_provider::TracingSpanProvider;

/// Attribute keys attached to per-message spans.
pub mod attributes {
    pub const MESSAGE_ID: &str = "messaging.message_id";
    pub const CONSUMER: &str = "messaging.consumer";
    pub const OUTCOME: &str = "messaging.outcome";
    pub const ERROR_MESSAGE: &str = "error.message";
}

/// Shared span provider handle.
pub type TracerRef = Arc<dyn SpanProvider>;

/// Opens spans for units of work.
pub trait SpanProvider: Send + Sync + 'static {
    /// Returns false when spans should not be opened at all.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Opens a span named `name` under `parent` and returns the derived context.
    fn start_span(&self, parent: &Context, name: &str) -> (Context, Box<dyn SpanHandle>);
}

/// An open span.
pub trait SpanHandle: Send {
    /// Tags the span.
    fn set_attribute(&mut self, key: &'static str, value: &str);

    /// Marks the span as failed.
    fn record_error(&mut self, error: &str);

    /// Closes the span.
    fn end(self: Box<Self>);
}

/// Tracer that never opens spans.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

impl SpanProvider for NoopTracer {
    fn is_enabled(&self) -> bool {
        false
    }

    fn start_span(&self, parent: &Context, _name: &str) -> (Context, Box<dyn SpanHandle>) {
        (parent.clone(), Box::new(NoopSpan))
    }
}

/// Span handle that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSpan;

impl SpanHandle for NoopSpan {
    fn set_attribute(&mut self, _key: &'static str, _value: &str) {}
    fn record_error(&mut self, _error: &str) {}
    fn end(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_passes_context_through() {
        let ctx = Context::default();
        let tracer = NoopTracer;
        assert!(!tracer.is_enabled());

        let (derived, mut span) = tracer.start_span(&ctx, "ignored");
        span.set_attribute(attributes::MESSAGE_ID, "m-1");
        span.record_error("boom");
        span.end();

        ctx.token().cancel();
        assert!(derived.is_cancelled());
    }
}
