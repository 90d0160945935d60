//! Client-to-server messages from bidirectional transports.
//!
//! WebSocket and WebTransport adapters hand every application payload to an
//! [`InboundHandler`], tagged with the connection it arrived on. What the
//! payload means is up to the embedding application.

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::{ConnectionId, TransportKind};
use crate::metrics::TransportMetrics;

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, connection_id: ConnectionId, payload: Bytes);
}

/// Default handler: records and logs the message, nothing else
#[derive(Debug, Default, Clone)]
pub struct LoggingInboundHandler;

#[async_trait]
impl InboundHandler for LoggingInboundHandler {
    async fn on_message(&self, connection_id: ConnectionId, payload: Bytes) {
        tracing::debug!(
            connection_id = %connection_id,
            bytes = payload.len(),
            "Inbound message"
        );
    }
}

/// Record the metric and forward to the handler
pub(crate) async fn deliver(
    handler: &dyn InboundHandler,
    kind: TransportKind,
    connection_id: ConnectionId,
    payload: Bytes,
) {
    TransportMetrics::record_inbound(kind);
    handler.on_message(connection_id, payload).await;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Captures every message it is handed
    #[derive(Default)]
    pub struct RecordingHandler {
        pub messages: Mutex<Vec<(ConnectionId, Bytes)>>,
    }

    #[async_trait]
    impl InboundHandler for RecordingHandler {
        async fn on_message(&self, connection_id: ConnectionId, payload: Bytes) {
            self.messages.lock().push((connection_id, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingHandler;
    use super::*;

    #[tokio::test]
    async fn test_deliver_forwards_payload() {
        let handler = RecordingHandler::default();
        let id = ConnectionId::new();
        deliver(&handler, TransportKind::WebSocket, id, Bytes::from_static(b"hi")).await;

        let messages = handler.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], (id, Bytes::from_static(b"hi")));
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_anything() {
        LoggingInboundHandler
            .on_message(ConnectionId::new(), Bytes::from_static(&[0, 1, 2]))
            .await;
    }
}
