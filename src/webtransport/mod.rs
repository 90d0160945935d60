//! WebTransport adapter.
//!
//! The HTTP/3 listener in [`quic`] terminates QUIC and hands each accepted
//! session to [`serve_session`] through the [`WebTransportSession`] trait.
//! Everything gateway-specific lives here:
//!
//! - a server-opened control stream carrying `connected` / `resumed`
//! - one server-opened stream per topic for reliable events, starting with a
//!   `{"topic": ...}` header frame
//! - best-effort events as datagrams, dropped when they do not fit
//! - client-opened streams carrying the JSON control protocol
//!
//! All stream frames are length-prefixed (see [`codec`]). A lost session
//! leaves the connection RECONNECTING; a new session passing `?resume=<token>`
//! picks it up again.

mod adapter;
pub mod codec;
pub mod memory;
mod quic;
mod session;

pub use adapter::{close_code, serve_session, SessionRequest};
pub use quic::{run_listener, ListenerError, QuicSession};
pub use session::WebTransportSession;
