//! Events flowing from the event source through the dispatcher to connections.
//!
//! An [`Event`] is immutable once the dispatcher has stamped it with a
//! sequence number; it is shared across the fan-out as `Arc<Event>`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Delivery guarantee requested by the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Ordered per topic, retried up to the backpressure policy
    #[default]
    Reliable,
    /// No ordering or retry; drops are expected
    BestEffort,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Reliable => "reliable",
            DeliveryMode::BestEffort => "best_effort",
        }
    }
}

/// A published event, stamped with its per-topic sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub topic: String,
    /// Strictly increasing within `topic`
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Optional type, rendered as the SSE `event:` field
    pub event_type: Option<String>,
    pub body: Bytes,
    pub mode: DeliveryMode,
}

impl Event {
    /// Borrow the body as raw JSON if it is a valid JSON document.
    pub fn json_body(&self) -> Option<&RawValue> {
        serde_json::from_slice::<&RawValue>(&self.body).ok()
    }

    pub fn is_reliable(&self) -> bool {
        self.mode == DeliveryMode::Reliable
    }
}

/// An event before the dispatcher has assigned its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub topic: String,
    pub event_type: Option<String>,
    pub body: Bytes,
    pub mode: DeliveryMode,
}

impl EventDraft {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>, mode: DeliveryMode) -> Self {
        Self {
            topic: topic.into(),
            event_type: None,
            body: body.into(),
            mode,
        }
    }

    pub(crate) fn stamp(self, seq: u64) -> Event {
        Event {
            topic: self.topic,
            seq,
            timestamp: Utc::now(),
            event_type: self.event_type,
            body: self.body,
            mode: self.mode,
        }
    }
}

/// Builder for event drafts
#[derive(Debug, Clone)]
pub struct EventBuilder {
    topic: String,
    event_type: Option<String>,
    body: Bytes,
    mode: DeliveryMode,
}

impl EventBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            event_type: None,
            body: Bytes::new(),
            mode: DeliveryMode::default(),
        }
    }

    /// Set the raw body bytes
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the body from a serializable value
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        Ok(self)
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn best_effort(self) -> Self {
        self.mode(DeliveryMode::BestEffort)
    }

    pub fn build(self) -> EventDraft {
        EventDraft {
            topic: self.topic,
            event_type: self.event_type,
            body: self.body,
            mode: self.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults_to_reliable() {
        let draft = EventBuilder::new("prices").body("x").build();
        assert_eq!(draft.mode, DeliveryMode::Reliable);
        assert!(draft.event_type.is_none());
    }

    #[test]
    fn test_json_body_roundtrip() {
        let draft = EventBuilder::new("prices")
            .json(&json!({"price": 100}))
            .unwrap()
            .event_type("tick")
            .build();
        let event = draft.stamp(7);
        assert_eq!(event.seq, 7);
        assert_eq!(event.event_type.as_deref(), Some("tick"));
        assert_eq!(event.json_body().unwrap().get(), r#"{"price":100}"#);
    }

    #[test]
    fn test_non_json_body() {
        let event = EventDraft::new("raw", &b"\x00\x01binary"[..], DeliveryMode::BestEffort).stamp(1);
        assert!(event.json_body().is_none());
        assert!(!event.is_reliable());
    }

    #[test]
    fn test_delivery_mode_serde() {
        let mode: DeliveryMode = serde_json::from_str(r#""best_effort""#).unwrap();
        assert_eq!(mode, DeliveryMode::BestEffort);
        assert_eq!(serde_json::to_string(&DeliveryMode::Reliable).unwrap(), r#""reliable""#);
    }
}
