//! # Messages delivered by a subscription.
//!
//! A [`Message`] is owned by the dispatch loop that pulled it. Settlement
//! (`ack`/`nack`) is delegated to the transport through [`Acknowledge`];
//! the message guarantees the transport sees **at most one** settlement call.
//!
//! ## Rules
//! - The engine never mutates the payload.
//! - The first `ack()`/`nack()` wins; later calls return `false` and do nothing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;

use crate::error::HandlerError;

/// Transport-side settlement primitive for one delivery.
pub trait Acknowledge: Send + Sync + 'static {
    /// Marks the delivery as consumed (no redelivery).
    fn ack(&self);

    /// Marks the delivery as not consumed (the transport may redeliver).
    fn nack(&self);
}

/// One delivery pulled from a subscription.
pub struct Message {
    id: String,
    payload: Vec<u8>,
    redelivered: bool,
    settled: AtomicBool,
    acker: Box<dyn Acknowledge>,
}

impl Message {
    /// Creates a message settled through `acker`.
    pub fn new(id: impl Into<String>, payload: Vec<u8>, acker: impl Acknowledge) -> Self {
        Self {
            id: id.into(),
            payload,
            redelivered: false,
            settled: AtomicBool::new(false),
            acker: Box::new(acker),
        }
    }

    /// Marks the message as a redelivery.
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Returns the unique message identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the raw payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns true if the transport delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Decodes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.payload).map_err(|e| HandlerError::Decode {
            error: e.to_string(),
        })
    }

    /// Acknowledges the message. Returns `true` if this call settled it.
    pub fn ack(&self) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.acker.ack();
        true
    }

    /// Negatively acknowledges the message. Returns `true` if this call settled it.
    pub fn nack(&self) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.acker.nack();
        true
    }

    /// Returns true once `ack` or `nack` was called.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}
