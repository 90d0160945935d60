//! Connection abstraction shared by every transport
//!
//! This module provides:
//! - Connection identity and transport kinds
//! - The lifecycle state machine
//! - Bounded outbound queues with per-lane routing

mod handle;
mod state;
mod types;

pub use handle::{Connection, ConnectionInfo, LeasedReceiver, QueueLimits};
pub use state::{ConnectionState, StateCell};
pub use types::{Capabilities, CloseReason, ConnectionId, SendError, SendOutcome, TransportKind};
