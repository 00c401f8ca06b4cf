//! # Per-unit-of-work context.
//!
//! A [`Context`] is what a handler receives alongside each message. It carries:
//! - a [`CancellationToken`] derived from the token passed to `consume`; each
//!   handler invocation gets its own child, so cancelling it stops nothing else,
//! - the current [`tracing::Span`] (the per-message span when tracing is enabled,
//!   otherwise the span the loop runs under).
//!
//! Contexts are cheap to clone and are derived, never mutated.

use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Cancellation + tracing context of one unit of work.
#[derive(Clone, Debug)]
pub struct Context {
    token: CancellationToken,
    span: Span,
}

impl Context {
    /// Creates a root context bound to `token`, with no active span.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            span: Span::none(),
        }
    }

    /// Returns the cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true once the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Returns the span of this unit of work.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Derives a context with the same token and a different span.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            token: self.token.clone(),
            span,
        }
    }

    /// Derives a context whose token is a child of this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            span: self.span.clone(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
