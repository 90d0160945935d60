use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::connection::{ConnectionId, TransportKind};
use crate::error::GatewayError;
use crate::event::Event;

/// Control messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
    /// Application payload for the inbound handler
    Message { data: serde_json::Value },
}

impl ClientMessage {
    /// Parse a control frame. Anything that does not decode is a protocol
    /// violation.
    pub fn parse(frame: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(frame)
            .map_err(|e| GatewayError::ProtocolViolation(format!("malformed control frame: {}", e)))
    }
}

/// Control messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: ConnectionId,
        transport: TransportKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Resumed {
        connection_id: ConnectionId,
        token: String,
        replayed: bool,
        discarded: usize,
    },
    Subscribed {
        topics: Vec<String>,
    },
    Unsubscribed {
        topics: Vec<String>,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn subscribed(topics: Vec<String>) -> Self {
        Self::Subscribed { topics }
    }

    pub fn unsubscribed(topics: Vec<String>) -> Self {
        Self::Unsubscribed { topics }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// JSON envelope for an event whose body is itself JSON. The body is
/// embedded verbatim, without a parse/re-serialize round trip.
#[derive(Debug, Serialize)]
pub struct EventEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    pub topic: &'a str,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<&'a str>,
    pub data: &'a RawValue,
}

impl<'a> EventEnvelope<'a> {
    /// `None` when the body is not valid JSON
    pub fn from_event(event: &'a Event) -> Option<Self> {
        Some(Self {
            kind: "event",
            topic: &event.topic,
            seq: event.seq,
            event: event.event_type.as_deref(),
            data: event.json_body()?,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
