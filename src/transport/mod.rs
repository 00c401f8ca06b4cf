//! # Broker collaborator contracts.
//!
//! The engine never speaks a broker protocol. It only requires:
//! - a [`Connection`] shared by every subscriber and publisher built from it,
//! - a [`Subscriber`] that yields a receive-only stream of [`Message`]s,
//! - a [`Publisher`] that accepts serialized payloads.
//!
//! ```text
//! Connection ──► new_subscriber(cfg) ──► Subscriber::subscribe(token) ──► MessageStream
//!            └─► new_publisher(cfg)  ──► Publisher::publish(msg) / close()
//! ```
//!
//! ## Rules
//! - A [`MessageStream`] closes when the source is exhausted, the token is
//!   cancelled, or the connection is closed.
//! - `subscribe` must not block beyond the transport handshake.
//! - [`Connection::close`] is effective once; later calls return
//!   [`TransportError::Closed`].
//!
//! [`memory::MemoryBroker`] is an in-process implementation used by tests and demos.

pub mod memory;
mod message;
pub mod options;
pub mod topic;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

pub use message::{Acknowledge, Message};
pub use options::{
    ConfigOption, ExchangeConfig, ExchangeKind, QueueConfig, TopologyStrategy, TransportConfig,
};

/// Receive-only, potentially infinite sequence of deliveries.
pub type MessageStream = mpsc::Receiver<Message>;

/// Shared subscriber handle.
pub type SubscriberRef = Arc<dyn Subscriber>;

/// A message ready to be handed to a publisher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Unique identifier carried by the envelope (not the body).
    pub id: String,
    /// Serialized body.
    pub payload: Vec<u8>,
}

/// Source of deliveries for one registration.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    /// Starts yielding messages until `token` is cancelled or the source ends.
    async fn subscribe(&self, token: CancellationToken) -> Result<MessageStream, TransportError>;
}

/// Short-lived publishing handle.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one message; with confirms enabled, waits for the broker's verdict.
    async fn publish(&self, msg: OutgoingMessage) -> Result<(), TransportError>;

    /// Releases the publisher.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Long-lived broker link shared by all subscribers and publishers.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Builds a subscription for `cfg`; rejects invalid bindings.
    fn new_subscriber(&self, cfg: &TransportConfig) -> Result<SubscriberRef, TransportError>;

    /// Builds a publisher for `cfg`.
    fn new_publisher(&self, cfg: &TransportConfig) -> Result<Box<dyn Publisher>, TransportError>;

    /// Closes the link.
    async fn close(&self) -> Result<(), TransportError>;
}
