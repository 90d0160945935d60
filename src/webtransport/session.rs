use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

/// A negotiated WebTransport session, as handed over by the HTTP/3 runtime.
///
/// The adapter polls `accept_bi`, `read_datagram` and `closed` together in
/// one `select!`, so those three must be cancel safe.
#[async_trait]
pub trait WebTransportSession: Send + Sync + 'static {
    type SendStream: AsyncWrite + Send + Unpin + 'static;
    type RecvStream: AsyncRead + Send + Unpin + 'static;

    /// Open a server-initiated bidirectional stream
    async fn open_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)>;

    /// Next client-initiated bidirectional stream; `None` once the session
    /// is gone
    async fn accept_bi(&self) -> Option<(Self::SendStream, Self::RecvStream)>;

    /// Fire-and-forget. An error means this datagram was not sent.
    fn send_datagram(&self, payload: Bytes) -> io::Result<()>;

    /// Next inbound datagram; `None` once the session is gone
    async fn read_datagram(&self) -> Option<Bytes>;

    /// `None` when the peer did not negotiate datagrams
    fn max_datagram_size(&self) -> Option<usize>;

    /// Resolves when the session ends, whichever side ended it
    async fn closed(&self);

    fn close(&self, code: u32, reason: &str);
}
