//! # Publish path.
//!
//! ```text
//! payload ─► serde_json::to_vec ─► id = uuid v4 ─► new_publisher(cfg) ─► publish ─► close (always)
//!               │                                     │                     │
//!               └─► Serialization                     └─► Publisher         └─► Publish
//! ```
//!
//! ## Rules
//! - Serialization happens before the transport is contacted.
//! - The publisher is short-lived and closed on every path once created.
//! - Nothing is retried.

use serde::Serialize;
use tracing::warn;

use crate::error::PublishError;
use crate::events::{Bus, Event, EventKind};
use crate::transport::{Connection, OutgoingMessage, TransportConfig};

/// Serializes `payload` and publishes it with a fresh id. Returns the id.
pub(crate) async fn publish<T>(
    connection: &dyn Connection,
    bus: &Bus,
    payload: &T,
    cfg: &TransportConfig,
) -> Result<String, PublishError>
where
    T: Serialize + ?Sized,
{
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => return Err(failed(bus, None, PublishError::Serialization(e))),
    };
    let id = uuid::Uuid::new_v4().to_string();

    let publisher = match connection.new_publisher(cfg) {
        Ok(publisher) => publisher,
        Err(e) => return Err(failed(bus, Some(&id), PublishError::Publisher(e))),
    };

    let sent = publisher
        .publish(OutgoingMessage {
            id: id.clone(),
            payload: body,
        })
        .await;

    if let Err(e) = publisher.close().await {
        warn!(message = %id, error = %e, "failed to close publisher");
    }

    match sent {
        Ok(()) => {
            bus.publish(Event::new(EventKind::MessagePublished).with_message(id.as_str()));
            Ok(id)
        }
        Err(e) => Err(failed(bus, Some(&id), PublishError::Publish(e))),
    }
}

fn failed(bus: &Bus, id: Option<&str>, err: PublishError) -> PublishError {
    let mut ev = Event::new(EventKind::PublishFailed).with_reason(err.to_string());
    if let Some(id) = id {
        ev = ev.with_message(id);
    }
    bus.publish(ev);
    err
}
