//! # queuevisor
//!
//! **Queuevisor** is a message-consumption engine for Rust.
//!
//! It subscribes to several message-bus queues concurrently, dispatches every
//! delivery to a registered handler, keeps each queue moving when handlers
//! fail or panic, and shuts down on a single cancellation signal.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │ Registration │   │ Registration │   │ Registration │
//!     │ (handler #1) │   │ (handler #2) │   │ (handler #3) │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Engine                                                           │
//! │  - Connection (shared broker link)                                │
//! │  - SpanProvider (per-message spans, no-op by default)             │
//! │  - Bus (broadcast events) ──► SubscriberSet (LogWriter, ...)      │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │ DispatchLoop │   │ DispatchLoop │   │ DispatchLoop │
//!     │ (one task)   │   │ (one task)   │   │ (one task)   │
//!     └┬─────────────┘   └┬─────────────┘   └┬─────────────┘
//!      │ Publishes:       │                  │
//!      │ - ConsumerActive │ - HandlerFailed  │ - ConsumerDead
//!      │ - MessageHandled │ - HandlerPanicked│ - ConsumerStopped
//!      ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Per message
//! ```text
//! stream.recv() ─► invoke(handler) inside catch_unwind ─► Outcome
//!                      ├─ Completed        ─► ack ─► MessageHandled
//!                      ├─ Failed(err)      ─► ack ─► HandlerFailed
//!                      └─ Faulted(panic)   ─► ack ─► HandlerPanicked
//! ```
//! Messages are always acknowledged and never redelivered by the engine: a
//! poison message cannot loop forever.
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                          |
//! |-------------------|----------------------------------------------------------|---------------------------------------------|
//! | **Engine**        | Register handlers, consume, publish, close.              | [`Engine`], [`EngineBuilder`]               |
//! | **Handlers**      | Async message handlers with an explicit name.            | [`Handler`], [`HandlerFn`], [`HandlerRef`]  |
//! | **Transport**     | Broker contracts, options, presets, in-memory broker.    | [`transport::Connection`], [`Message`]      |
//! | **Tracing**       | Injected span provider.                                  | [`SpanProvider`], [`TracingSpanProvider`]   |
//! | **Subscriber API**| Hook into lifecycle events (logging, metrics, alerts).   | [`Subscribe`], [`LogWriter`]                |
//! | **Errors**        | Typed errors for every layer.                            | [`EngineError`], [`PublishError`]           |
//! | **Configuration** | Engine and connection settings.                          | [`EngineConfig`], [`ConnectionConfig`]      |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use queuevisor::{Engine, HandlerError, HandlerFn, HandlerRef};
//! use queuevisor::transport::memory::MemoryBroker;
//! use queuevisor::transport::options::{with_queue, with_routing_key};
//! use queuevisor::transport::QueueConfig;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     broker.declare_queue("greetings", true)?;
//!
//!     let mut engine = Engine::builder(Arc::new(broker.clone())).build();
//!     let token = CancellationToken::new();
//!
//!     let stop = token.clone();
//!     let hello: HandlerRef = HandlerFn::arc("hello", move |_ctx, msg| {
//!         let stop = stop.clone();
//!         async move {
//!             let name: String = msg.decode()?;
//!             println!("hello, {name}");
//!             stop.cancel();
//!             Ok::<_, HandlerError>(())
//!         }
//!     });
//!     engine.register(hello, [with_queue(QueueConfig::durable("greetings"))])?;
//!
//!     engine.publish("world", [with_routing_key("greetings")]).await?;
//!     engine.consume(token).await?;
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```
mod config;
mod context;
mod core;
mod error;
mod events;
mod handlers;
mod subscribers;
mod tracer;
pub mod transport;

// ---- Public re-exports ----

pub use config::{ConnectionConfig, EngineConfig};
pub use context::Context;
pub use crate::core::{Engine, EngineBuilder, LoopState, Outcome, wait_for_shutdown_signal};
pub use error::{EngineError, HandlerError, PublishError, TransportError};
pub use events::{Bus, Event, EventKind};
pub use handlers::{Handler, HandlerFn, HandlerRef, Registration};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use tracer::{NoopSpan, NoopTracer, SpanHandle, SpanProvider, TracerRef, TracingSpanProvider, attributes};
pub use transport::{Acknowledge, Message};
