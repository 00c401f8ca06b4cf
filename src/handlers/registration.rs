//! # Consumption registration.
//!
//! A [`Registration`] binds one [`Handler`] to one subscription built from the
//! shared connection. It is immutable once created and is driven by exactly
//! one dispatch loop per `consume` call.

use std::fmt;

use crate::handlers::HandlerRef;
use crate::transport::{SubscriberRef, TransportConfig};

/// Handler + subscription pair owned by the engine.
#[derive(Clone)]
pub struct Registration {
    handler: HandlerRef,
    subscriber: SubscriberRef,
    config: TransportConfig,
}

impl Registration {
    /// Creates a registration from an already-built subscriber.
    pub fn new(handler: HandlerRef, subscriber: SubscriberRef, config: TransportConfig) -> Self {
        Self {
            handler,
            subscriber,
            config,
        }
    }

    /// Returns the handler.
    pub fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    /// Returns the subscription.
    pub fn subscriber(&self) -> &SubscriberRef {
        &self.subscriber
    }

    /// Returns the configuration the subscription was built from.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Convenience: returns the handler name.
    pub fn name(&self) -> &str {
        self.handler.name()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("handler", &self.name())
            .field("queue", &self.config.queue_name())
            .field("exchange", &self.config.exchange_name())
            .field("routing_key", &self.config.routing_key())
            .finish()
    }
}
