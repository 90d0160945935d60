//! Connection supervisor
//!
//! This module provides:
//! - Admission and connection limits
//! - Lifecycle transitions, suspend and resume with continuation tokens
//! - Ordered teardown (registry first, then the live set)
//! - Idle and reconnect-window sweeps

mod lifecycle;
mod stats;
mod token;

pub use lifecycle::{Resumed, Supervisor};
pub use stats::{SupervisorStats, SweepReport};
pub use token::ContinuationToken;
