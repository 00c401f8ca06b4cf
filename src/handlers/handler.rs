//! # Handler abstraction.
//!
//! A [`Handler`] has an explicit [`name`](Handler::name) and an async
//! [`handle`](Handler::handle) method invoked once per delivered message.
//! The name labels per-message spans and lifecycle events.
//!
//! From the engine's point of view a handler may block, perform I/O, fail, or
//! panic. Whatever it does, the message is acknowledged afterwards.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::HandlerError;
use crate::transport::Message;

/// Shared handle to a handler.
pub type HandlerRef = Arc<dyn Handler>;

/// # Named asynchronous message handler.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use queuevisor::{Context, Handler, HandlerError, Message};
///
/// struct Audit;
///
/// #[async_trait]
/// impl Handler for Audit {
///     fn name(&self) -> &str { "audit" }
///
///     async fn handle(&self, ctx: Context, msg: Arc<Message>) -> Result<(), HandlerError> {
///         if ctx.is_cancelled() {
///             return Ok(());
///         }
///         let _body: serde_json::Value = msg.decode()?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Returns a stable, human-readable handler name.
    fn name(&self) -> &str;

    /// Processes one message.
    ///
    /// The handler must not settle the message itself; the dispatch loop acknowledges it.
    async fn handle(&self, ctx: Context, msg: Arc<Message>) -> Result<(), HandlerError>;
}
