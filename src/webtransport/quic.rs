//! HTTP/3 listener for WebTransport, on top of `wtransport`.
//!
//! Each accepted CONNECT becomes a [`QuicSession`] and is handed to
//! [`serve_session`] with the query of its path (`/wt?topics=a,b&resume=..`).

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use axum::http::Uri;
use bytes::Bytes;
use tokio::sync::broadcast;
use wtransport::endpoint::IncomingSession;
use wtransport::{Connection, Endpoint, Identity, RecvStream, SendStream, ServerConfig, VarInt};

use crate::config::WebTransportConfig;
use crate::server::AppState;

use super::adapter::{serve_session, SessionRequest};
use super::session::WebTransportSession;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Invalid WebTransport address '{0}'")]
    Address(String),
    #[error("Failed to load TLS identity: {0}")]
    Identity(String),
    #[error("Failed to bind WebTransport endpoint: {0}")]
    Bind(#[from] io::Error),
}

/// An established WebTransport session
pub struct QuicSession {
    connection: Connection,
}

impl QuicSession {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

fn to_io<E>(e: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::ConnectionAborted, e)
}

#[async_trait]
impl WebTransportSession for QuicSession {
    type SendStream = SendStream;
    type RecvStream = RecvStream;

    async fn open_bi(&self) -> io::Result<(SendStream, RecvStream)> {
        let opening = self.connection.open_bi().await.map_err(to_io)?;
        opening.await.map_err(to_io)
    }

    async fn accept_bi(&self) -> Option<(SendStream, RecvStream)> {
        self.connection.accept_bi().await.ok()
    }

    fn send_datagram(&self, payload: Bytes) -> io::Result<()> {
        self.connection.send_datagram(payload).map_err(to_io)
    }

    async fn read_datagram(&self) -> Option<Bytes> {
        let datagram = self.connection.receive_datagram().await.ok()?;
        Some(Bytes::copy_from_slice(&datagram))
    }

    fn max_datagram_size(&self) -> Option<usize> {
        self.connection.max_datagram_size()
    }

    async fn closed(&self) {
        self.connection.closed().await;
    }

    fn close(&self, code: u32, reason: &str) {
        self.connection.close(VarInt::from_u32(code), reason.as_bytes());
    }
}

/// Accept WebTransport sessions until the shutdown signal.
///
/// Open sessions are not touched here; they end when graceful shutdown
/// closes their connections.
pub async fn run_listener(
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ListenerError> {
    let raw_addr = state.settings.webtransport_addr();
    let addr: SocketAddr = raw_addr
        .parse()
        .map_err(|_| ListenerError::Address(raw_addr.clone()))?;
    let identity = load_identity(&state.settings.webtransport).await?;

    let config = ServerConfig::builder()
        .with_bind_address(addr)
        .with_identity(identity)
        .keep_alive_interval(Some(state.settings.gateway.heartbeat_interval()))
        .build();
    let endpoint = Endpoint::server(config)?;
    tracing::info!(addr = %addr, "WebTransport listening");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("WebTransport listener received shutdown signal");
                break;
            }
            incoming = endpoint.accept() => {
                tokio::spawn(handle_incoming(state.clone(), incoming));
            }
        }
    }

    tracing::info!("WebTransport listener stopped");
    Ok(())
}

async fn handle_incoming(state: AppState, incoming: IncomingSession) {
    let request = match incoming.await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "WebTransport handshake failed");
            return;
        }
    };

    let params = request
        .path()
        .parse::<Uri>()
        .map(|uri| SessionRequest::from_uri(&uri))
        .unwrap_or_default();

    let connection = match request.accept().await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::debug!(error = %e, "WebTransport session not established");
            return;
        }
    };

    if let Err(e) = serve_session(state, QuicSession::new(connection), params).await {
        tracing::debug!(error = %e, "WebTransport session rejected");
    }
}

async fn load_identity(config: &WebTransportConfig) -> Result<Identity, ListenerError> {
    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => Identity::load_pemfiles(cert, key)
            .await
            .map_err(|e| ListenerError::Identity(e.to_string())),
        _ => {
            tracing::warn!("No WebTransport certificate configured, using a self-signed one");
            Identity::self_signed(["localhost", "127.0.0.1", "::1"])
                .map_err(|e| ListenerError::Identity(e.to_string()))
        }
    }
}
