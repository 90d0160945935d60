//! Connection identity, transport kinds and send outcomes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::event::DeliveryMode;

/// Opaque connection identifier. Backed by a random UUID, so an ID is never
/// handed out twice within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Sse,
    WebSocket,
    WebTransport,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Sse,
        TransportKind::WebSocket,
        TransportKind::WebTransport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Sse => "sse",
            TransportKind::WebSocket => "websocket",
            TransportKind::WebTransport => "webtransport",
        }
    }

    /// Whether the client side can transparently re-establish the
    /// connection (EventSource reconnect, WebTransport session migration).
    pub fn supports_resume(&self) -> bool {
        matches!(self, TransportKind::Sse | TransportKind::WebTransport)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery paths negotiated for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capabilities {
    ReliableOnly,
    ReliableAndDatagram,
}

impl Capabilities {
    pub fn supports_datagrams(&self) -> bool {
        matches!(self, Capabilities::ReliableAndDatagram)
    }
}

/// Outbound lane an event takes on a given connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// Bounded reliable queue; a full queue is backpressure
    Reliable,
    /// Reliable queue, single non-blocking attempt; a full queue is a drop
    ReliableTry,
    /// Datagram queue; a full queue is a drop
    Datagram,
}

/// Pick the lane for an event. SSE has no lossy path, so best-effort events
/// are downgraded to reliable there.
pub(crate) fn route(kind: TransportKind, capabilities: Capabilities, mode: DeliveryMode) -> Lane {
    match mode {
        DeliveryMode::Reliable => Lane::Reliable,
        DeliveryMode::BestEffort => match kind {
            TransportKind::Sse => Lane::Reliable,
            _ if capabilities.supports_datagrams() => Lane::Datagram,
            _ => Lane::ReliableTry,
        },
    }
}

/// Successful result of `Connection::send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted into an outbound queue
    Ack,
    /// Best-effort event discarded because its lane was saturated
    Dropped,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full")]
    Backpressure,
    #[error("connection closed")]
    Closed,
}

impl From<SendError> for GatewayError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Backpressure => GatewayError::Backpressure,
            SendError::Closed => GatewayError::Closed,
        }
    }
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnect,
    ProtocolViolation,
    MissedPong,
    IdleTimeout,
    ReconnectExpired,
    HandshakeFailed,
    TransportError,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::MissedPong => "missed_pong",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ReconnectExpired => "reconnect_expired",
            CloseReason::HandshakeFailed => "handshake_failed",
            CloseReason::TransportError => "transport_error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
