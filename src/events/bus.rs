//! # Event bus.
//!
//! [`Bus`] wraps a [`tokio::sync::broadcast`] sender. Publishing never waits:
//! with no receivers the event is discarded, and a receiver that falls more
//! than `capacity` events behind gets `RecvError::Lagged` and loses the oldest
//! ones.
//!
//! ```text
//! DispatchLoop ─┐
//! DispatchLoop ─┼─► Bus ─► engine listener ─► SubscriberSet
//! publish path ─┘      └─► Engine::bus().subscribe()  (tests, custom tooling)
//! ```

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for engine events. Clones share the channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus holding up to `capacity` undelivered events (at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sends `ev` to every current receiver.
    pub fn publish(&self, ev: Event) {
        // no receivers is not an error
        let _ = self.tx.send(ev);
    }

    /// Returns a receiver of events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
