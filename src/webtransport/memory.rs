//! In-process WebTransport session pair.
//!
//! Streams are `tokio::io::duplex` pipes and datagrams are channel messages.
//! Used by the test suites and handy for embedding the gateway behind a
//! custom transport.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::session::WebTransportSession;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

type CloseInfo = Arc<Mutex<Option<(u32, String)>>>;

/// Create a connected server session and client
pub fn pair(max_datagram_size: Option<usize>) -> (MemorySession, MemoryClient) {
    let (server_opened_tx, server_opened_rx) = mpsc::unbounded_channel();
    let (client_opened_tx, client_opened_rx) = mpsc::unbounded_channel();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let close_info = CloseInfo::default();

    let session = MemorySession {
        server_opened: server_opened_tx,
        client_opened: AsyncMutex::new(client_opened_rx),
        to_client: to_client_tx,
        from_client: AsyncMutex::new(to_server_rx),
        max_datagram_size,
        closed: closed.clone(),
        close_info: close_info.clone(),
    };
    let client = MemoryClient {
        server_opened: server_opened_rx,
        client_opened: client_opened_tx,
        to_server: to_server_tx,
        from_server: to_client_rx,
        closed,
        close_info,
    };
    (session, client)
}

/// Server half of an in-process session
pub struct MemorySession {
    server_opened: mpsc::UnboundedSender<DuplexStream>,
    client_opened: AsyncMutex<mpsc::UnboundedReceiver<DuplexStream>>,
    to_client: mpsc::UnboundedSender<Bytes>,
    from_client: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    max_datagram_size: Option<usize>,
    closed: CancellationToken,
    close_info: CloseInfo,
}

#[async_trait]
impl WebTransportSession for MemorySession {
    type SendStream = WriteHalf<DuplexStream>;
    type RecvStream = ReadHalf<DuplexStream>;

    async fn open_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        self.server_opened
            .send(remote)
            .map_err(|_| io::Error::from(io::ErrorKind::NotConnected))?;
        let (recv, send) = tokio::io::split(local);
        Ok((send, recv))
    }

    async fn accept_bi(&self) -> Option<(Self::SendStream, Self::RecvStream)> {
        let mut incoming = self.client_opened.lock().await;
        let stream = tokio::select! {
            _ = self.closed.cancelled() => None,
            stream = incoming.recv() => stream,
        }?;
        let (recv, send) = tokio::io::split(stream);
        Some((send, recv))
    }

    fn send_datagram(&self, payload: Bytes) -> io::Result<()> {
        let Some(max) = self.max_datagram_size else {
            return Err(io::ErrorKind::Unsupported.into());
        };
        if payload.len() > max {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"));
        }
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.to_client
            .send(payload)
            .map_err(|_| io::Error::from(io::ErrorKind::NotConnected))
    }

    async fn read_datagram(&self) -> Option<Bytes> {
        let mut incoming = self.from_client.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            datagram = incoming.recv() => datagram,
        }
    }

    fn max_datagram_size(&self) -> Option<usize> {
        self.max_datagram_size
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn close(&self, code: u32, reason: &str) {
        self.close_info
            .lock()
            .get_or_insert_with(|| (code, reason.to_string()));
        self.closed.cancel();
    }
}

/// Client half of an in-process session. Dropping it loses the session.
pub struct MemoryClient {
    server_opened: mpsc::UnboundedReceiver<DuplexStream>,
    client_opened: mpsc::UnboundedSender<DuplexStream>,
    to_server: mpsc::UnboundedSender<Bytes>,
    from_server: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
    close_info: CloseInfo,
}

impl MemoryClient {
    /// Next stream the server opened
    pub async fn accept_stream(&mut self) -> Option<DuplexStream> {
        tokio::select! {
            biased;
            stream = self.server_opened.recv() => stream,
            _ = self.closed.cancelled() => None,
        }
    }

    pub fn open_stream(&self) -> Option<DuplexStream> {
        if self.closed.is_cancelled() {
            return None;
        }
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        self.client_opened.send(remote).ok()?;
        Some(local)
    }

    pub fn send_datagram(&self, payload: Bytes) -> bool {
        !self.closed.is_cancelled() && self.to_server.send(payload).is_ok()
    }

    pub async fn recv_datagram(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            datagram = self.from_server.recv() => datagram,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Drop the session without a close frame, as a lost network would
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Code and reason the server closed the session with
    pub fn close_info(&self) -> Option<(u32, String)> {
        self.close_info.lock().clone()
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_server_opened_stream_reaches_client() {
        let (session, mut client) = pair(Some(1200));
        let (mut send, _recv) = session.open_bi().await.unwrap();
        send.write_all(b"hi").await.unwrap();

        let mut stream = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_datagram_size_limit() {
        let (session, mut client) = pair(Some(4));
        session.send_datagram(Bytes::from_static(b"ok")).unwrap();
        assert!(session.send_datagram(Bytes::from_static(b"too big")).is_err());
        assert_eq!(client.recv_datagram().await.unwrap(), Bytes::from_static(b"ok"));

        let (session, _client) = pair(None);
        assert!(session.send_datagram(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_close_is_visible_to_client() {
        let (session, client) = pair(None);
        session.close(7, "bye");
        client.closed().await;
        assert_eq!(client.close_info(), Some((7, "bye".to_string())));
        assert!(session.accept_bi().await.is_none());
    }
}
