//! # Message handlers and registrations.
//!
//! This module provides the handler-related types:
//! - [`Handler`] - trait for named async message handlers
//! - [`HandlerFn`] - closure-backed handler implementation
//! - [`HandlerRef`] - shared reference to a handler (`Arc<dyn Handler>`)
//! - [`Registration`] - a handler bound to one subscription

mod handler;
mod handler_fn;
mod registration;

pub use handler::{Handler, HandlerRef};
pub use handler_fn::HandlerFn;
pub use registration::Registration;
