//! # Engine core.
//!
//! - [`Engine`]: registrations, `consume`/`run`, publishing, `close`
//! - [`EngineBuilder`]: wiring of config, span provider and event subscribers
//! - `dispatch`: one loop per registration
//! - `invoke`: the per-message fault boundary and its [`Outcome`]
//! - `publish`: the serialize/publish/release path
//! - `shutdown`: OS signal handling

mod builder;
mod dispatch;
mod engine;
mod invoke;
mod publish;
mod shutdown;

pub use builder::EngineBuilder;
pub use dispatch::LoopState;
pub use engine::Engine;
pub use invoke::Outcome;
pub use shutdown::wait_for_shutdown_signal;

pub(crate) use invoke::panic_message;
