//! # Engine events.
//!
//! - [`Event`] / [`EventKind`]: what happened, to which consumer and message
//! - [`Bus`]: broadcast channel every producer publishes to
//!
//! Producers are the engine (`register`, publish path, signal watcher), each
//! dispatch loop, and the subscriber workers. The only built-in consumer is
//! the engine listener feeding the `SubscriberSet`; tests may attach their
//! own receivers through `Engine::bus`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
