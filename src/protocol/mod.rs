//! Control protocol shared by the bidirectional transports
//!
//! WebSocket text frames and WebTransport control streams carry the same
//! JSON messages. Event payloads use [`EventEnvelope`] when the body is JSON.

mod control;
mod message;

pub use control::{handle_control, handle_subscribe, parse_topic_list, validate_topics, Control};
pub use message::{ClientMessage, EventEnvelope, ServerMessage};
