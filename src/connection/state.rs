//! Connection lifecycle state machine.
//!
//! ```text
//! CONNECTING -> OPEN -> CLOSING -> CLOSED
//!                 |        ^
//!                 v        |
//!            RECONNECTING -+   (RECONNECTING -> OPEN on resume)
//! ```
//!
//! States only move forward, with the single exception of the
//! `RECONNECTING -> OPEN` recovery edge.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Reconnecting = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Open, Reconnecting)
                | (Open, Closing)
                | (Reconnecting, Open)
                | (Reconnecting, Closing)
                | (Reconnecting, Closed)
                | (Closing, Closed)
        )
    }

    /// CLOSING or CLOSED
    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Reconnecting,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free holder for a connection's state.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Move to `to`, returning the previous state. Concurrent callers race
    /// through compare-exchange; exactly one of two conflicting transitions wins.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState, GatewayError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from(current);
            if !from.can_transition_to(to) {
                return Err(GatewayError::InvalidTransition { from, to });
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
