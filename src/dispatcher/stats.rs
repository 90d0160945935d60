use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::event::DeliveryMode;

/// Result of fanning one event out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub topic: String,
    pub seq: u64,
    pub mode: DeliveryMode,
    /// Connections resolved from the registry
    pub subscribers: usize,
    /// Accepted into an outbound queue
    pub delivered: usize,
    /// Best-effort events discarded on a saturated lane
    pub dropped: usize,
    /// Reliable events parked for a retry
    pub deferred: usize,
    /// Connections found closed and torn down
    pub closed: usize,
    /// Connections that disappeared or were not open yet
    pub skipped: usize,
}

/// Statistics for the dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub events_published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub backpressured: AtomicU64,
    pub closed: AtomicU64,
    /// Parked events delivered on a later attempt
    pub retried: AtomicU64,
    /// Parked events given up on after the last attempt
    pub retry_dropped: AtomicU64,
}

impl DispatcherStats {
    pub(crate) fn record(&self, report: &DispatchReport) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.backpressured
            .fetch_add(report.deferred as u64, Ordering::Relaxed);
        self.closed.fetch_add(report.closed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            backpressured: self.backpressured.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            retry_dropped: self.retry_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub events_published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub backpressured: u64,
    pub closed: u64,
    pub retried: u64,
    pub retry_dropped: u64,
}
