//! # Event subscribers for the engine.
//!
//! This module provides the [`Subscribe`] trait, the [`SubscriberSet`] fan-out,
//! and the built-in [`LogWriter`].
//!
//! ## Architecture
//! ```text
//! DispatchLoop ── publish(Event) ──► Bus ──► engine listener ──► SubscriberSet
//!                                                                 ├──► LogWriter (tracing)
//!                                                                 ├──► Metrics
//!                                                                 └──► Alerts ...
//! ```

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
