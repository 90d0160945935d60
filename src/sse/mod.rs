//! Server-Sent Events adapter.
//!
//! One long-lived `text/event-stream` response per connection. Server to
//! client only; the route answers any method other than GET with 405.
//!
//! # Endpoint
//!
//! `GET /sse?topics=a,b[&resume=<token>]`
//!
//! # Frames
//!
//! - `connected` - first frame; its `id:` is the continuation token
//! - `resumed` - first frame after a successful resume, with a fresh token
//! - unnamed or typed event frames carrying the published body
//! - `: ping` comment heartbeat every heartbeat interval
//!
//! When the client disconnects the connection is suspended for the
//! reconnect grace window. A browser `EventSource` sends the last id back as
//! `Last-Event-ID`, which resumes it.

pub mod frame;
mod handler;

pub use handler::{sse_handler, SseQuery};
