//! WebSocket adapter.
//!
//! `GET /ws?topics=a,b` upgrades to a socket speaking the JSON control
//! protocol in text frames. Binary frames are application payloads for the
//! inbound handler. WebSocket connections cannot be resumed; a dropped
//! socket is torn down.

mod handler;

pub use handler::{ws_handler, WsQuery};
