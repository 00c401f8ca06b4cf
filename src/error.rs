//! Error types used by the queuevisor engine, handlers, and transports.
//!
//! This module defines four error enums:
//!
//! - [`EngineError`] - errors raised by the consumption engine itself.
//! - [`HandlerError`] - failures reported by user message handlers.
//! - [`PublishError`] - failures of the publish path.
//! - [`TransportError`] - failures reported by the broker collaborator.
//!
//! All of them provide `as_label` for logs/metrics.

use thiserror::Error;

/// # Errors produced by the consumption engine.
///
/// Only [`EngineError::SubscriptionSetup`] and [`EngineError::LoopFatal`] relate to
/// consumption; handler failures never surface here.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// The transport refused to build a subscription for a registration.
    #[error("subscription setup failed for consumer {consumer:?}: {source}")]
    SubscriptionSetup {
        /// Handler name of the rejected registration.
        consumer: String,
        /// Transport error that caused the rejection.
        #[source]
        source: TransportError,
    },

    /// A dispatch loop failed outside the per-message boundary (e.g. during subscribe).
    #[error("consumer {consumer:?} stopped fatally: {reason}")]
    LoopFatal {
        /// Handler name of the failed loop.
        consumer: String,
        /// Transport error text or recovered panic message.
        reason: String,
    },

    /// `consume` was invoked more than once on the same engine.
    #[error("engine is already consuming or has consumed")]
    AlreadyConsumed,

    /// Closing the shared connection failed.
    #[error("failed to close connection: {0}")]
    Close(#[source] TransportError),
}

impl EngineError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use queuevisor::EngineError;
    ///
    /// let err = EngineError::LoopFatal { consumer: "orders".into(), reason: "boom".into() };
    /// assert_eq!(err.as_label(), "engine_loop_fatal");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::SubscriptionSetup { .. } => "engine_subscription_setup",
            EngineError::LoopFatal { .. } => "engine_loop_fatal",
            EngineError::AlreadyConsumed => "engine_already_consumed",
            EngineError::Close(_) => "engine_close",
        }
    }

    /// Returns the consumer name attached to the error, if any.
    pub fn consumer(&self) -> Option<&str> {
        match self {
            EngineError::SubscriptionSetup { consumer, .. }
            | EngineError::LoopFatal { consumer, .. } => Some(consumer),
            _ => None,
        }
    }
}

/// # Failures reported by a message handler.
///
/// A handler error never stops consumption: it is published as
/// `HandlerFailed`, recorded on the span, and the message is still acknowledged.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing failed.
    #[error("handler failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// The payload could not be decoded into the expected type.
    #[error("payload decode failed: {error}")]
    Decode {
        /// The underlying decoder message.
        error: String,
    },
}

impl HandlerError {
    /// Builds a [`HandlerError::Fail`] from anything displayable.
    pub fn fail(error: impl std::fmt::Display) -> Self {
        HandlerError::Fail {
            error: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Fail { .. } => "handler_failed",
            HandlerError::Decode { .. } => "handler_decode",
        }
    }
}

/// # Errors produced by the publish path.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PublishError {
    /// The payload could not be serialized; the transport was not contacted.
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The short-lived publisher could not be created.
    #[error("error creating publisher: {0}")]
    Publisher(#[source] TransportError),

    /// The transport failed to publish (including a negative confirm).
    #[error("error publishing message: {0}")]
    Publish(#[source] TransportError),
}

impl PublishError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PublishError::Serialization(_) => "publish_serialization",
            PublishError::Publisher(_) => "publish_publisher",
            PublishError::Publish(_) => "publish_failed",
        }
    }
}

/// # Errors reported by the broker collaborator.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection (or the object built from it) is closed.
    #[error("connection closed")]
    Closed,

    /// The configuration was rejected (e.g. malformed binding).
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    /// Topology was expected to exist but does not.
    #[error("{entity} {name:?} not found")]
    NotFound {
        /// Kind of the missing entity (`exchange`, `queue`).
        entity: &'static str,
        /// Its name.
        name: String,
    },

    /// The broker refused the operation (e.g. negative publisher confirm).
    #[error("rejected by broker: {reason}")]
    Rejected {
        /// Broker-supplied reason.
        reason: String,
    },
}

impl TransportError {
    /// Builds a [`TransportError::InvalidConfig`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        TransportError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::Closed => "transport_closed",
            TransportError::InvalidConfig { .. } => "transport_invalid_config",
            TransportError::NotFound { .. } => "transport_not_found",
            TransportError::Rejected { .. } => "transport_rejected",
        }
    }
}
