use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::types::{now_rfc3339, Event};

/// Broker-internal topics (`__consumer_offsets` and friends) carry no events.
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with("__")
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("event is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("event is missing required field {0}")]
    MissingField(&'static str),
}

/// What happened to one inbound message.
#[derive(Debug)]
pub enum Ingested {
    /// Dispatch is running in the background.
    Dispatched(JoinHandle<Option<DispatchSummary>>),
    /// The message arrived on a system topic and was dropped.
    Ignored,
}

/// Turns raw transport messages into events and hands them to the dispatcher.
///
/// Acknowledges as soon as the event is decoded; delivery happens on a
/// background task.
#[derive(Clone)]
pub struct EventIngestor {
    dispatcher: Arc<Dispatcher>,
}

impl EventIngestor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn handle(&self, transport_topic: &str, bytes: &[u8]) -> Result<Ingested, IngestError> {
        if is_system_topic(transport_topic) {
            tracing::trace!(topic = transport_topic, "ignoring system topic message");
            return Ok(Ingested::Ignored);
        }

        let event = decode(transport_topic, bytes).map_err(|err| {
            tracing::warn!(topic = transport_topic, error = %err, "dropping undecodable event");
            err
        })?;
        tracing::info!(topic = %event.topic, originator = %event.originator, "event received");
        Ok(Ingested::Dispatched(self.dispatcher.spawn_notify(event)))
    }
}

/// Decode one message, filling in the topic and timestamp when absent.
pub fn decode(transport_topic: &str, bytes: &[u8]) -> Result<Event, IngestError> {
    let mut event: Event = serde_json::from_slice(bytes)?;
    if event.topic.trim().is_empty() {
        event.topic = transport_topic.to_string();
    }
    if event.timestamp.trim().is_empty() {
        event.timestamp = now_rfc3339();
    }
    if event.originator.trim().is_empty() {
        return Err(IngestError::MissingField("originator"));
    }
    if event.mime_type.trim().is_empty() {
        return Err(IngestError::MissingField("mime-type"));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_topic_and_timestamp_are_defaulted() {
        let bytes = serde_json::to_vec(&json!({
            "originator": "billing",
            "mime-type": "application/json",
            "payload": { "id": 1 }
        }))
        .unwrap();
        let event = decode("orders", &bytes).unwrap();
        assert_eq!(event.topic, "orders");
        assert!(chrono::DateTime::parse_from_rfc3339(&event.timestamp).is_ok());
        assert_eq!(event.payload, json!({ "id": 1 }));
    }

    #[test]
    fn explicit_topic_wins_over_transport_topic() {
        let bytes = br#"{"topic":"orders.created","originator":"o","mime-type":"text/plain","timestamp":"2024-01-01T00:00:00Z"}"#;
        let event = decode("orders", bytes).unwrap();
        assert_eq!(event.topic, "orders.created");
        assert_eq!(event.timestamp, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn required_fields_are_enforced() {
        let err = decode("orders", br#"{"mime-type":"application/json"}"#).unwrap_err();
        assert!(matches!(err, IngestError::MissingField("originator")));
        let err = decode("orders", br#"{"originator":"o"}"#).unwrap_err();
        assert!(matches!(err, IngestError::MissingField("mime-type")));
        let err = decode("orders", b"not json").unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));
    }

    #[test]
    fn system_topics_are_recognised() {
        assert!(is_system_topic("__consumer_offsets"));
        assert!(!is_system_topic("orders"));
        assert!(!is_system_topic("_orders"));
    }
}
