//! Event dispatcher
//!
//! This module provides:
//! - Per-topic sequencing and synchronous fan-out
//! - Outcome classification (ack, dropped, backpressure, closed)
//! - Bounded per-connection retry after backpressure

mod publish;
mod retry;
mod stats;

pub use publish::Dispatcher;
pub use stats::{DispatchReport, DispatcherStats, DispatcherStatsSnapshot};
