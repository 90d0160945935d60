//! Supervisor statistics and report structures

use std::collections::HashMap;

use serde::Serialize;

/// Live connection statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStats {
    pub total_connections: usize,
    pub by_transport: HashMap<String, usize>,
    pub by_state: HashMap<String, usize>,
    pub accepted_total: u64,
    pub resumed_total: u64,
    pub closed_total: u64,
}

/// Result of one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idle_closed: usize,
    pub reconnect_expired: usize,
    pub handshake_expired: usize,
    pub reconnecting: usize,
}

impl SweepReport {
    pub fn closed(&self) -> usize {
        self.idle_closed + self.reconnect_expired + self.handshake_expired
    }
}
