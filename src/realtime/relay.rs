//! Event log to gateway bridge.
//!
//! [`EventRelay`] is an [`EventHandler`] that forwards every event of a
//! module stream to the subscribers of a topic derived from the event,
//! through that module's gateway in the [`GatewayDirectory`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use super::directory::GatewayDirectory;
use crate::event_log::{Event, EventHandler, HandlerError};

/// Topic used when an event names none
pub const DEFAULT_EVENT_TOPIC: &str = "events";

/// Topic an event is pushed to
///
/// `metadata.topic` when set, else the second dot-separated segment of the
/// type (`finbot.transactions.created` goes to `transactions`), else
/// [`DEFAULT_EVENT_TOPIC`].
pub fn topic_for(event: &Event) -> String {
    if let Some(topic) = event.metadata_value("topic").filter(|t| !t.is_empty()) {
        return topic.to_string();
    }
    event
        .event_type
        .split('.')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .unwrap_or(DEFAULT_EVENT_TOPIC)
        .to_string()
}

pub struct EventRelay {
    gateways: Arc<GatewayDirectory>,
    module: String,
}

impl EventRelay {
    pub fn new(gateways: Arc<GatewayDirectory>, module: impl Into<String>) -> Self {
        Self {
            gateways,
            module: module.into(),
        }
    }
}

impl EventHandler for EventRelay {
    fn handle<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let topic = topic_for(event);
            let report = self
                .gateways
                .push_event(&self.module, &topic, event)
                .map_err(|e| HandlerError::new(e.to_string()))?;
            debug!(id = %event.id, topic = %topic, delivered = report.delivered, "event relayed");
            Ok(())
        })
    }
}
