//! `tracing`-backed span provider.
//!
//! Each span is an `info`-level `consume` span, child of the context's span,
//! with `otel.name` set to the requested name. Errors go into the declared
//! `error` field; attributes are emitted as debug events inside the span.

use tracing::Span;
use tracing::field::Empty;

use crate::context::Context;
use crate::tracer::{SpanHandle, SpanProvider};

/// Opens per-message spans through the `tracing` crate.
#[derive(Clone, Copy, Debug)]
pub struct TracingSpanProvider {
    enabled: bool,
}

impl TracingSpanProvider {
    /// Creates an enabled provider.
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Creates a provider that is enabled only if `enabled` is true.
    pub fn with_enabled(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Default for TracingSpanProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanProvider for TracingSpanProvider {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn start_span(&self, parent: &Context, name: &str) -> (Context, Box<dyn SpanHandle>) {
        let span = tracing::info_span!(
            target: "queuevisor::consume",
            parent: parent.span(),
            "consume",
            otel.name = %name,
            error = Empty,
        );
        (parent.with_span(span.clone()), Box::new(TracingSpan { span }))
    }
}

struct TracingSpan {
    span: Span,
}

impl SpanHandle for TracingSpan {
    fn set_attribute(&mut self, key: &'static str, value: &str) {
        tracing::debug!(parent: &self.span, attribute = key, value, "span attribute");
    }

    fn record_error(&mut self, error: &str) {
        self.span.record("error", error);
    }

    fn end(self: Box<Self>) {}
}
