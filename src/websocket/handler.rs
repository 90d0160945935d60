use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::connection::{
    Capabilities, CloseReason, Connection, ConnectionId, LeasedReceiver, TransportKind,
};
use crate::error::AppError;
use crate::event::Event;
use crate::inbound::{self, InboundHandler};
use crate::metrics::{HeartbeatMetrics, TransportMetrics};
use crate::protocol::{
    handle_control, handle_subscribe, parse_topic_list, validate_topics, ClientMessage, Control,
    EventEnvelope, ServerMessage,
};
use crate::registry::SubscriptionRegistry;
use crate::server::AppState;

const CONTROL_BUFFER_SIZE: usize = 32;

/// How long the writer gets to flush a final error and close frame
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Comma-separated topics to subscribe on connect
    pub topics: Option<String>,
}

/// Written by the receive side, drained by the send task
#[derive(Debug)]
enum Outbound {
    Reply(ServerMessage),
    Close(CloseReason),
}

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip(ws, state, query))]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, AppError> {
    let topics = parse_topic_list(query.topics.as_deref());
    validate_topics(&topics, state.settings.gateway.max_subscriptions_per_connection)?;

    // Registered as CONNECTING; only a completed upgrade opens it
    let (connection, _token) = state
        .supervisor
        .accept(TransportKind::WebSocket, Capabilities::ReliableOnly)?;
    let id = connection.id();

    tracing::info!(connection_id = %id, "WebSocket upgrade requested");

    let supervisor = state.supervisor.clone();
    Ok(ws
        .max_message_size(state.settings.gateway.max_frame_size)
        .on_failed_upgrade(move |e| {
            tracing::warn!(connection_id = %id, error = %e, "WebSocket upgrade failed");
            supervisor.teardown(id, CloseReason::HandshakeFailed);
        })
        .on_upgrade(move |socket| handle_socket(socket, state, connection, topics)))
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip_all,
    fields(connection_id = %connection.id(), otel.kind = "server")
)]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    connection: Arc<Connection>,
    topics: Vec<String>,
) {
    let id = connection.id();
    let supervisor = state.supervisor.clone();

    if let Err(e) = supervisor.open(id) {
        tracing::warn!(connection_id = %id, error = %e, "WebSocket could not be opened");
        supervisor.teardown(id, CloseReason::HandshakeFailed);
        return;
    }
    let Some(lease) = connection.lease_reliable() else {
        supervisor.teardown(id, CloseReason::HandshakeFailed);
        return;
    };

    let (tx, rx) = mpsc::channel::<Outbound>(CONTROL_BUFFER_SIZE);
    let _ = tx
        .send(Outbound::Reply(ServerMessage::Connected {
            connection_id: id,
            transport: TransportKind::WebSocket,
            token: None,
        }))
        .await;
    if !topics.is_empty() {
        for reply in handle_subscribe(&state.registry, id, topics) {
            let _ = tx.send(Outbound::Reply(reply)).await;
        }
    }

    tracing::info!(connection_id = %id, "WebSocket connection established");

    let last_pong = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
    let (ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(send_loop(
        ws_sender,
        lease,
        rx,
        last_pong.clone(),
        state.settings.gateway.heartbeat_interval(),
        state.settings.gateway.pong_timeout(),
    ));

    let ctx = InboundContext {
        registry: state.registry.clone(),
        inbound: state.inbound.clone(),
        connection: connection.clone(),
        replies: tx,
        last_pong,
    };
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if let Some(reason) = ctx.process(msg).await {
                        return reason;
                    }
                }
                Err(e) => {
                    tracing::debug!(connection_id = %ctx.connection.id(), error = %e, "WebSocket receive error");
                    return CloseReason::TransportError;
                }
            }
        }
        CloseReason::ClientDisconnect
    });

    let reason = tokio::select! {
        result = &mut send_task => {
            recv_task.abort();
            result.unwrap_or(CloseReason::TransportError)
        }
        result = &mut recv_task => {
            let reason = result.unwrap_or(CloseReason::TransportError);
            // The receive side dropped its sender, so the writer finishes
            // once it has flushed what is left
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
                send_task.abort();
            }
            reason
        }
    };

    // A close initiated elsewhere (sweep, shutdown) keeps its own reason
    let reason = connection.close_reason().unwrap_or(reason);
    supervisor.teardown(id, reason);

    tracing::info!(connection_id = %id, reason = %reason, "WebSocket connection closed");
}

/// Drains control replies and the outbound queue into the socket, and sends
/// the keepalive pings. Returns why it stopped.
async fn send_loop<S>(
    mut sink: S,
    mut lease: LeasedReceiver,
    mut replies: mpsc::Receiver<Outbound>,
    last_pong: Arc<AtomicI64>,
    heartbeat_interval: Duration,
    pong_timeout: Duration,
) -> CloseReason
where
    S: futures::Sink<Message> + Unpin,
{
    let mut ping = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let connection = lease.connection().clone();

    let reason = loop {
        let msg = tokio::select! {
            biased;
            outbound = replies.recv() => match outbound {
                Some(Outbound::Reply(reply)) => match reply.to_json() {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize control reply");
                        continue;
                    }
                },
                Some(Outbound::Close(reason)) => break reason,
                // Receive side finished
                None => break CloseReason::ClientDisconnect,
            },
            event = lease.recv() => match event {
                Some(event) => encode_event(&event),
                None => break connection.close_reason().unwrap_or(CloseReason::Shutdown),
            },
            _ = ping.tick() => {
                let silent_ms = Utc::now().timestamp_millis() - last_pong.load(Ordering::Relaxed);
                if silent_ms > pong_timeout.as_millis() as i64 {
                    tracing::info!(connection_id = %connection.id(), silent_ms, "WebSocket missed pong");
                    break CloseReason::MissedPong;
                }
                HeartbeatMetrics::record_sent(TransportKind::WebSocket);
                Message::Ping(Bytes::new())
            }
        };

        if sink.send(msg).await.is_err() {
            return CloseReason::TransportError;
        }
    };

    let _ = sink.send(close_message(reason)).await;
    reason
}

/// JSON bodies go out in a text envelope, anything else as a raw binary frame
pub(crate) fn encode_event(event: &Event) -> Message {
    match EventEnvelope::from_event(event).map(|envelope| envelope.to_json()) {
        Some(Ok(json)) => Message::Text(json.into()),
        _ => Message::Binary(event.body.clone()),
    }
}

fn close_message(reason: CloseReason) -> Message {
    let code = match reason {
        CloseReason::ProtocolViolation => close_code::PROTOCOL,
        CloseReason::MissedPong | CloseReason::IdleTimeout => close_code::POLICY,
        CloseReason::Shutdown => close_code::AWAY,
        _ => close_code::NORMAL,
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.as_str().into(),
    }))
}

/// Everything the receive side needs for one connection
struct InboundContext {
    registry: Arc<SubscriptionRegistry>,
    inbound: Arc<dyn InboundHandler>,
    connection: Arc<Connection>,
    replies: mpsc::Sender<Outbound>,
    last_pong: Arc<AtomicI64>,
}

impl InboundContext {
    /// Handle one frame. `Some(reason)` ends the connection.
    async fn process(&self, msg: Message) -> Option<CloseReason> {
        let id: ConnectionId = self.connection.id();
        match msg {
            Message::Text(text) => {
                self.connection.touch();
                let client_msg = match ClientMessage::parse(text.as_bytes()) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "WebSocket protocol violation");
                        TransportMetrics::record_protocol_violation(TransportKind::WebSocket);
                        let _ = self
                            .replies
                            .send(Outbound::Reply(ServerMessage::error(e.code(), e.to_string())))
                            .await;
                        let _ = self
                            .replies
                            .send(Outbound::Close(CloseReason::ProtocolViolation))
                            .await;
                        return Some(CloseReason::ProtocolViolation);
                    }
                };

                match handle_control(&self.registry, id, client_msg) {
                    Control::Reply(replies) => {
                        for reply in replies {
                            if self.replies.send(Outbound::Reply(reply)).await.is_err() {
                                return Some(CloseReason::TransportError);
                            }
                        }
                    }
                    Control::Forward(payload) => self.forward(payload).await,
                }
                None
            }
            Message::Binary(data) => {
                self.connection.touch();
                self.forward(data).await;
                None
            }
            Message::Ping(_) => {
                // axum answers with a pong itself
                self.connection.touch();
                None
            }
            Message::Pong(_) => {
                self.connection.touch();
                self.last_pong
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                None
            }
            Message::Close(_) => {
                tracing::debug!(connection_id = %id, "Received close frame");
                Some(CloseReason::ClientDisconnect)
            }
        }
    }

    async fn forward(&self, payload: Bytes) {
        inbound::deliver(
            self.inbound.as_ref(),
            TransportKind::WebSocket,
            self.connection.id(),
            payload,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::event::{DeliveryMode, EventDraft};
    use crate::inbound::testing::RecordingHandler;
    use crate::supervisor::Supervisor;
    use futures::channel::mpsc as fmpsc;

    struct Fixture {
        supervisor: Arc<Supervisor>,
        connection: Arc<Connection>,
        handler: Arc<RecordingHandler>,
        ctx: InboundContext,
        rx: mpsc::Receiver<Outbound>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new(4));
        let supervisor = Arc::new(Supervisor::new(GatewayConfig::default(), registry.clone()));
        let (connection, _) = supervisor
            .accept(TransportKind::WebSocket, Capabilities::ReliableOnly)
            .unwrap();
        supervisor.open(connection.id()).unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let (tx, rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let ctx = InboundContext {
            registry,
            inbound: handler.clone(),
            connection: connection.clone(),
            replies: tx,
            last_pong: Arc::new(AtomicI64::new(0)),
        };
        Fixture {
            supervisor,
            connection,
            handler,
            ctx,
            rx,
        }
    }

    fn reply(outbound: Outbound) -> ServerMessage {
        match outbound {
            Outbound::Reply(msg) => msg,
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    #[test]
    fn test_json_event_goes_out_as_text_envelope() {
        let event = EventDraft::new("prices", r#"{"price":100}"#, DeliveryMode::Reliable).stamp(3);
        match encode_event(&event) {
            Message::Text(text) => {
                assert_eq!(
                    text.as_str(),
                    r#"{"type":"event","topic":"prices","seq":3,"data":{"price":100}}"#
                );
            }
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_event_goes_out_raw() {
        let event = EventDraft::new("blobs", vec![0u8, 159, 146, 150], DeliveryMode::Reliable).stamp(1);
        assert_eq!(
            encode_event(&event),
            Message::Binary(Bytes::from_static(&[0, 159, 146, 150]))
        );
    }

    #[tokio::test]
    async fn test_subscribe_frame_updates_registry() {
        let mut f = fixture();
        let frame = r#"{"type":"Subscribe","payload":{"topics":["prices"]}}"#;
        assert_eq!(f.ctx.process(Message::Text(frame.into())).await, None);

        assert_eq!(f.ctx.registry.resolve("prices").as_slice(), &[f.connection.id()]);
        assert_eq!(
            reply(f.rx.recv().await.unwrap()),
            ServerMessage::subscribed(vec!["prices".into()])
        );
    }

    #[tokio::test]
    async fn test_malformed_control_frame_is_protocol_violation() {
        let mut f = fixture();
        let reason = f.ctx.process(Message::Text("{not json".into())).await;
        assert_eq!(reason, Some(CloseReason::ProtocolViolation));

        assert!(matches!(
            reply(f.rx.recv().await.unwrap()),
            ServerMessage::Error { code, .. } if code == "PROTOCOL_VIOLATION"
        ));
        assert!(matches!(
            f.rx.recv().await,
            Some(Outbound::Close(CloseReason::ProtocolViolation))
        ));
    }

    #[tokio::test]
    async fn test_binary_and_message_payloads_reach_inbound_handler() {
        let f = fixture();
        f.ctx
            .process(Message::Binary(Bytes::from_static(b"raw")))
            .await;
        f.ctx
            .process(Message::Text(
                r#"{"type":"Message","payload":{"data":{"hello":"world"}}}"#.into(),
            ))
            .await;

        let messages = f.handler.messages.lock();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], (f.connection.id(), Bytes::from_static(b"raw")));
        assert_eq!(messages[1].1, Bytes::from_static(br#"{"hello":"world"}"#));
    }

    #[tokio::test]
    async fn test_pong_refreshes_keepalive() {
        let f = fixture();
        f.ctx.process(Message::Pong(Bytes::new())).await;
        assert!(f.ctx.last_pong.load(Ordering::Relaxed) > 0);
        assert_eq!(
            f.ctx.process(Message::Close(None)).await,
            Some(CloseReason::ClientDisconnect)
        );
    }

    #[tokio::test]
    async fn test_send_loop_delivers_events_then_closes_on_missed_pong() {
        let f = fixture();
        let lease = f.connection.lease_reliable().unwrap();
        let (_replies_tx, replies_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let (sink, mut written) = fmpsc::unbounded::<Message>();

        let event = Arc::new(EventDraft::new("prices", "{}", DeliveryMode::Reliable).stamp(1));
        f.connection.send(&event).unwrap();

        // No pong ever arrives
        let last_pong = Arc::new(AtomicI64::new(0));
        let reason = send_loop(
            sink,
            lease,
            replies_rx,
            last_pong,
            Duration::from_millis(10),
            Duration::from_millis(5),
        )
        .await;
        assert_eq!(reason, CloseReason::MissedPong);

        assert!(matches!(written.next().await, Some(Message::Text(_))));
        match written.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::POLICY),
            other => panic!("expected close frame, got {:?}", other),
        }

        assert!(f.supervisor.teardown(f.connection.id(), reason));
    }

    #[tokio::test]
    async fn test_send_loop_stops_when_connection_closed() {
        let f = fixture();
        let lease = f.connection.lease_reliable().unwrap();
        let (_replies_tx, replies_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let (sink, mut written) = fmpsc::unbounded::<Message>();

        f.supervisor.teardown(f.connection.id(), CloseReason::Shutdown);
        let reason = send_loop(
            sink,
            lease,
            replies_rx,
            Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(reason, CloseReason::Shutdown);
        match written.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::AWAY),
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
