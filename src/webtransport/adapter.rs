use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use axum::{extract::Query, http::Uri};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::connection::{
    Capabilities, CloseReason, Connection, ConnectionId, LeasedReceiver, TransportKind,
};
use crate::error::GatewayError;
use crate::event::Event;
use crate::inbound::{self, InboundHandler};
use crate::metrics::{DeliveryMetrics, HeartbeatMetrics, TransportMetrics};
use crate::protocol::{
    handle_control, handle_subscribe, parse_topic_list, validate_topics, ClientMessage, Control,
    ServerMessage,
};
use crate::registry::SubscriptionRegistry;
use crate::server::AppState;
use crate::supervisor::{ContinuationToken, Supervisor};

use super::codec;
use super::session::WebTransportSession;

/// Application close codes sent with the session close
pub mod close_code {
    pub const NORMAL: u32 = 0;
    pub const PROTOCOL_VIOLATION: u32 = 1;
    pub const HANDSHAKE_FAILED: u32 = 2;
    pub const POLICY: u32 = 3;
    pub const GOING_AWAY: u32 = 4;
}

/// Query parameters of the CONNECT request that opened the session
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SessionRequest {
    /// Comma-separated topics
    pub topics: Option<String>,
    /// Continuation token of a suspended connection
    pub resume: Option<String>,
}

impl SessionRequest {
    /// Read the parameters off the CONNECT URI. A malformed query counts as
    /// an empty one.
    pub fn from_uri(uri: &Uri) -> Self {
        Query::<SessionRequest>::try_from_uri(uri)
            .map(|Query(request)| request)
            .unwrap_or_default()
    }
}

/// Serve one WebTransport session until it ends.
///
/// Returns once the session is lost (the connection is then suspended for a
/// resume) or the connection is closed. Only handshake problems are errors.
#[tracing::instrument(
    name = "wt.session",
    skip_all,
    fields(connection_id = tracing::field::Empty, resuming = request.resume.is_some())
)]
pub async fn serve_session<S: WebTransportSession>(
    state: AppState,
    session: S,
    request: SessionRequest,
) -> Result<(), GatewayError> {
    let gateway = &state.settings.gateway;
    let topics = parse_topic_list(request.topics.as_deref());
    if let Err(e) = validate_topics(&topics, gateway.max_subscriptions_per_connection) {
        session.close(close_code::HANDSHAKE_FAILED, &e.to_string());
        return Err(e);
    }

    let presented = request.resume.as_deref().and_then(|t| t.parse().ok());
    let handshake = match handshake(&state.supervisor, &session, presented) {
        Ok(handshake) => handshake,
        Err(e) => {
            session.close(close_code::HANDSHAKE_FAILED, &e.to_string());
            return Err(e);
        }
    };
    let connection = handshake.connection.clone();
    let id = connection.id();
    tracing::Span::current().record("connection_id", tracing::field::display(id));

    if let Some(max) = session.max_datagram_size() {
        connection.set_datagram_budget(max.min(gateway.max_datagram_size));
    }

    let mut hello = vec![handshake.hello];
    if !topics.is_empty() {
        hello.extend(handle_subscribe(&state.registry, id, topics));
    }

    // Open before the client hears about it, so every event published
    // after the handshake reply reaches it
    if !handshake.resumed {
        if let Err(e) = state.supervisor.open(id) {
            state.supervisor.teardown(id, CloseReason::HandshakeFailed);
            session.close(close_code::HANDSHAKE_FAILED, &e.to_string());
            return Err(e);
        }
    }

    // The server-opened control stream carries the handshake reply; without
    // it the client never learns its token
    let control = match open_control_stream(&session, &hello).await {
        Ok(control) => control,
        Err(e) => {
            tracing::warn!(connection_id = %id, error = %e, "WebTransport control stream failed");
            if handshake.resumed {
                state.supervisor.suspend(id);
            } else {
                state.supervisor.teardown(id, CloseReason::HandshakeFailed);
            }
            session.close(close_code::HANDSHAKE_FAILED, "control stream failed");
            return Err(GatewayError::HandshakeFailed(e.to_string()));
        }
    };

    let Some(reliable) = connection.lease_reliable() else {
        state.supervisor.teardown(id, CloseReason::HandshakeFailed);
        session.close(close_code::HANDSHAKE_FAILED, "queue already attached");
        return Err(GatewayError::HandshakeFailed("queue already attached".into()));
    };

    tracing::info!(
        connection_id = %id,
        datagrams = connection.capabilities().supports_datagrams(),
        "WebTransport session established"
    );

    let driver = SessionDriver {
        session: Arc::new(session),
        connection: connection.clone(),
        ctx: Arc::new(ControlContext {
            registry: state.registry.clone(),
            supervisor: state.supervisor.clone(),
            inbound: state.inbound.clone(),
            connection: connection.clone(),
            max_frame_size: gateway.max_frame_size,
        }),
        writers: HashMap::new(),
        tasks: JoinSet::new(),
        stream_buffer: gateway.outbound_queue_capacity.max(1),
        _control: control,
    };
    let session = driver.session.clone();
    let datagrams = connection.lease_datagrams();
    let exit = driver
        .run(reliable, datagrams, gateway.heartbeat_interval())
        .await;

    match exit {
        Exit::SessionLost => {
            if state.supervisor.suspend(id) {
                tracing::info!(connection_id = %id, "WebTransport session lost, awaiting resume");
            }
        }
        Exit::Closed => {
            let reason = connection.close_reason().unwrap_or(CloseReason::Shutdown);
            state.supervisor.teardown(id, reason);
            session.close(code_for(reason), reason.as_str());
            tracing::info!(connection_id = %id, reason = %reason, "WebTransport session closed");
        }
    }
    Ok(())
}

struct Handshake {
    connection: Arc<Connection>,
    hello: ServerMessage,
    resumed: bool,
}

/// Resume when a valid token was presented, otherwise admit a fresh
/// connection in CONNECTING.
fn handshake<S: WebTransportSession>(
    supervisor: &Supervisor,
    session: &S,
    presented: Option<ContinuationToken>,
) -> Result<Handshake, GatewayError> {
    if let Some(token) = presented {
        match supervisor.resume(&token, TransportKind::WebTransport) {
            Ok(resumed) => {
                return Ok(Handshake {
                    hello: ServerMessage::Resumed {
                        connection_id: resumed.connection.id(),
                        token: resumed.token.to_string(),
                        replayed: resumed.replayed,
                        discarded: resumed.discarded,
                    },
                    connection: resumed.connection,
                    resumed: true,
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "WebTransport resume rejected, starting fresh");
            }
        }
    }

    let capabilities = if session.max_datagram_size().is_some() {
        Capabilities::ReliableAndDatagram
    } else {
        Capabilities::ReliableOnly
    };
    let (connection, token) = supervisor.accept(TransportKind::WebTransport, capabilities)?;
    Ok(Handshake {
        hello: ServerMessage::Connected {
            connection_id: connection.id(),
            transport: TransportKind::WebTransport,
            token: Some(token.to_string()),
        },
        connection,
        resumed: false,
    })
}

async fn open_control_stream<S: WebTransportSession>(
    session: &S,
    messages: &[ServerMessage],
) -> io::Result<FramedWrite<S::SendStream, LengthDelimitedCodec>> {
    let (send, _recv) = session.open_bi().await?;
    let mut writer = FramedWrite::new(send, codec::outbound());
    for msg in messages {
        writer.feed(Bytes::from(msg.to_json()?)).await?;
    }
    SinkExt::<Bytes>::flush(&mut writer).await?;
    Ok(writer)
}

fn code_for(reason: CloseReason) -> u32 {
    match reason {
        CloseReason::ProtocolViolation => close_code::PROTOCOL_VIOLATION,
        CloseReason::HandshakeFailed => close_code::HANDSHAKE_FAILED,
        CloseReason::IdleTimeout | CloseReason::ReconnectExpired => close_code::POLICY,
        CloseReason::Shutdown => close_code::GOING_AWAY,
        _ => close_code::NORMAL,
    }
}

enum Exit {
    /// Transport gone; the connection may be resumed
    SessionLost,
    /// The connection itself was closed
    Closed,
}

/// Writer task of one topic stream
struct TopicWriter {
    events: mpsc::Sender<Arc<Event>>,
    task: AbortHandle,
}

struct SessionDriver<S: WebTransportSession> {
    session: Arc<S>,
    connection: Arc<Connection>,
    ctx: Arc<ControlContext>,
    /// One writer per topic, spawned on the topic's first event
    writers: HashMap<String, TopicWriter>,
    /// Topic writers and client control streams; dropping the set aborts them
    tasks: JoinSet<()>,
    /// Events a topic writer may hold before its stream counts as stalled
    stream_buffer: usize,
    /// Held open for the life of the session
    _control: FramedWrite<S::SendStream, LengthDelimitedCodec>,
}

impl<S: WebTransportSession> SessionDriver<S> {
    /// Never awaits a stream write, so one stalled stream cannot hold up the
    /// datagram path, the other topics or a close.
    async fn run(
        mut self,
        mut reliable: LeasedReceiver,
        mut datagrams: Option<LeasedReceiver>,
        heartbeat_interval: std::time::Duration,
    ) -> Exit {
        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.session.closed() => return Exit::SessionLost,
                event = reliable.recv() => match event {
                    Some(event) => self.write_reliable(event),
                    None => return Exit::Closed,
                },
                event = next_datagram(&mut datagrams) => match event {
                    Some(event) => self.send_datagram(&event),
                    None => datagrams = None,
                },
                accepted = self.session.accept_bi() => match accepted {
                    Some((send, recv)) => {
                        self.tasks.spawn(serve_control_stream(self.ctx.clone(), send, recv));
                    }
                    None => return Exit::SessionLost,
                },
                datagram = self.session.read_datagram() => match datagram {
                    Some(payload) => {
                        self.connection.touch();
                        self.ctx.forward(payload).await;
                    }
                    None => return Exit::SessionLost,
                },
                // QUIC keeps the session alive; only the idle clock needs it
                _ = heartbeat.tick() => {
                    self.connection.touch();
                    HeartbeatMetrics::record_sent(TransportKind::WebTransport);
                }
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }
    }

    /// Hand the event to its topic's writer. A writer whose buffer is full
    /// has a stream the client stopped reading: that stream is reset and a
    /// fresh one starts with this event.
    fn write_reliable(&mut self, event: Arc<Event>) {
        if let Some(writer) = self.writers.get(&event.topic) {
            match writer.events.try_send(event.clone()) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(
                        connection_id = %self.connection.id(),
                        topic = %event.topic,
                        seq = event.seq,
                        "Topic stream stalled, resetting"
                    );
                    TransportMetrics::record_stream_reset();
                    writer.task.abort();
                }
                Err(TrySendError::Closed(_)) => {}
            }
            self.writers.remove(&event.topic);
        }

        let (events, rx) = mpsc::channel(self.stream_buffer);
        // A fresh channel always has room for one
        let _ = events.try_send(event.clone());
        let task = self.tasks.spawn(write_topic_stream(
            self.session.clone(),
            self.connection.id(),
            event.topic.clone(),
            rx,
        ));
        self.writers
            .insert(event.topic.clone(), TopicWriter { events, task });
    }

    fn send_datagram(&self, event: &Event) {
        if let Err(e) = self.session.send_datagram(event.body.clone()) {
            tracing::trace!(
                connection_id = %self.connection.id(),
                topic = %event.topic,
                error = %e,
                "Datagram dropped"
            );
            DeliveryMetrics::record_outcome("dropped", 1);
        }
    }
}

/// Write one topic's events to its own stream, opening it on demand. A
/// failed write loses that event and the stream; the next event opens a
/// fresh one.
async fn write_topic_stream<S: WebTransportSession>(
    session: Arc<S>,
    connection_id: ConnectionId,
    topic: String,
    mut events: mpsc::Receiver<Arc<Event>>,
) {
    let mut stream: Option<FramedWrite<S::SendStream, LengthDelimitedCodec>> = None;

    while let Some(event) = events.recv().await {
        if stream.is_none() {
            match open_topic_stream(&*session, &topic).await {
                Ok(opened) => stream = Some(opened),
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, topic = %topic, error = %e, "Could not open topic stream");
                    TransportMetrics::record_stream_reset();
                    continue;
                }
            }
        }

        let Some(writer) = stream.as_mut() else {
            continue;
        };
        if let Err(e) = writer.send(event.body.clone()).await {
            tracing::debug!(
                connection_id = %connection_id,
                topic = %topic,
                seq = event.seq,
                error = %e,
                "Topic stream failed, reopening on next event"
            );
            TransportMetrics::record_stream_reset();
            stream = None;
        }
    }
}

async fn open_topic_stream<S: WebTransportSession>(
    session: &S,
    topic: &str,
) -> io::Result<FramedWrite<S::SendStream, LengthDelimitedCodec>> {
    let (send, _recv) = session.open_bi().await?;
    let mut writer = FramedWrite::new(send, codec::outbound());
    writer.send(codec::header_frame(topic)?).await?;
    Ok(writer)
}

async fn next_datagram(lease: &mut Option<LeasedReceiver>) -> Option<Arc<Event>> {
    match lease {
        Some(lease) => lease.recv().await,
        None => std::future::pending().await,
    }
}

/// Shared by the tasks serving client-opened control streams
struct ControlContext {
    registry: Arc<SubscriptionRegistry>,
    supervisor: Arc<Supervisor>,
    inbound: Arc<dyn InboundHandler>,
    connection: Arc<Connection>,
    max_frame_size: usize,
}

impl ControlContext {
    fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    async fn forward(&self, payload: Bytes) {
        inbound::deliver(
            self.inbound.as_ref(),
            TransportKind::WebTransport,
            self.id(),
            payload,
        )
        .await;
    }

    fn violation(&self, detail: &str) {
        tracing::warn!(connection_id = %self.id(), detail = %detail, "WebTransport protocol violation");
        TransportMetrics::record_protocol_violation(TransportKind::WebTransport);
        self.supervisor
            .teardown(self.id(), CloseReason::ProtocolViolation);
    }
}

/// Read length-prefixed control frames off one client stream and answer on
/// the same stream.
async fn serve_control_stream<W, R>(ctx: Arc<ControlContext>, send: W, recv: R)
where
    W: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = FramedRead::new(recv, codec::inbound(ctx.max_frame_size));
    let mut writer = FramedWrite::new(send, codec::outbound());

    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                ctx.violation("control frame exceeds max_frame_size");
                return;
            }
            Err(e) => {
                tracing::debug!(connection_id = %ctx.id(), error = %e, "Control stream ended");
                return;
            }
        };
        ctx.connection.touch();

        let msg = match ClientMessage::parse(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                if let Ok(json) = ServerMessage::error(e.code(), e.to_string()).to_json() {
                    let _ = writer.send(Bytes::from(json)).await;
                }
                ctx.violation(&e.to_string());
                return;
            }
        };

        match handle_control(&ctx.registry, ctx.id(), msg) {
            Control::Reply(replies) => {
                for reply in replies {
                    let Ok(json) = reply.to_json() else { continue };
                    if writer.send(Bytes::from(json)).await.is_err() {
                        return;
                    }
                }
            }
            Control::Forward(payload) => ctx.forward(payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::connection::ConnectionState;
    use crate::event::DeliveryMode;
    use crate::inbound::testing::RecordingHandler;
    use crate::webtransport::codec::StreamHeader;
    use crate::webtransport::memory::{pair, MemoryClient};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Reader = FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>;
    type Writer = FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>;

    fn framed(stream: DuplexStream) -> (Reader, Writer) {
        let (recv, send) = tokio::io::split(stream);
        (
            FramedRead::new(recv, codec::outbound()),
            FramedWrite::new(send, codec::outbound()),
        )
    }

    async fn next_frame(reader: &mut Reader) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), reader.next())
            .await
            .expect("frame timed out")
            .expect("stream ended")
            .expect("bad frame")
            .freeze()
    }

    async fn next_message(reader: &mut Reader) -> ServerMessage {
        serde_json::from_slice(&next_frame(reader).await).unwrap()
    }

    async fn accept(client: &mut MemoryClient) -> (Reader, Writer) {
        let stream = tokio::time::timeout(Duration::from_secs(2), client.accept_stream())
            .await
            .expect("no stream opened")
            .expect("session closed");
        framed(stream)
    }

    /// Accept `count` topic streams, keyed by the topic in their header
    async fn accept_topics(client: &mut MemoryClient, count: usize) -> HashMap<String, Reader> {
        let mut streams = HashMap::new();
        for _ in 0..count {
            let (mut reader, _) = accept(client).await;
            let header: StreamHeader =
                serde_json::from_slice(&next_frame(&mut reader).await).unwrap();
            streams.insert(header.topic, reader);
        }
        streams
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn request(topics: &str) -> SessionRequest {
        SessionRequest {
            topics: Some(topics.to_string()),
            resume: None,
        }
    }

    /// Spawn a session and return the client plus its handshake reply
    async fn connect(
        state: &AppState,
        request: SessionRequest,
    ) -> (MemoryClient, Reader, ServerMessage) {
        let (session, mut client) = pair(Some(64));
        tokio::spawn(serve_session(state.clone(), session, request));
        let (mut control, _) = accept(&mut client).await;
        let hello = next_message(&mut control).await;
        (client, control, hello)
    }

    #[test]
    fn test_session_request_from_uri() {
        let uri: Uri = "/wt?topics=a,b&resume=abc".parse().unwrap();
        let request = SessionRequest::from_uri(&uri);
        assert_eq!(request.topics.as_deref(), Some("a,b"));
        assert_eq!(request.resume.as_deref(), Some("abc"));

        let uri: Uri = "/wt".parse().unwrap();
        assert!(SessionRequest::from_uri(&uri).topics.is_none());
    }

    #[tokio::test]
    async fn test_reliable_events_use_one_stream_per_topic() {
        let state = AppState::new(Settings::default());
        let (mut client, mut control, hello) = connect(&state, request("prices,news")).await;

        assert!(matches!(hello, ServerMessage::Connected { token: Some(_), .. }));
        assert_eq!(
            next_message(&mut control).await,
            ServerMessage::subscribed(vec!["prices".into(), "news".into()])
        );

        state.dispatcher.publish("prices", r#"{"p":1}"#, DeliveryMode::Reliable).unwrap();
        state.dispatcher.publish("prices", r#"{"p":2}"#, DeliveryMode::Reliable).unwrap();
        state.dispatcher.publish("news", "hello", DeliveryMode::Reliable).unwrap();

        // Topic writers run independently, so streams may open in any order
        let mut streams = accept_topics(&mut client, 2).await;
        let prices = streams.get_mut("prices").unwrap();
        assert_eq!(&next_frame(prices).await[..], br#"{"p":1}"#);
        assert_eq!(&next_frame(prices).await[..], br#"{"p":2}"#);

        let news = streams.get_mut("news").unwrap();
        assert_eq!(&next_frame(news).await[..], b"hello");
    }

    #[tokio::test]
    async fn test_best_effort_goes_out_as_datagram() {
        let state = AppState::new(Settings::default());
        let (mut client, _control, _) = connect(&state, request("ticks")).await;

        let report = state
            .dispatcher
            .publish("ticks", "small", DeliveryMode::BestEffort)
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(
            client.recv_datagram().await.unwrap(),
            Bytes::from_static(b"small")
        );

        // Over the 64 byte session budget
        let report = state
            .dispatcher
            .publish("ticks", vec![b'x'; 100], DeliveryMode::BestEffort)
            .unwrap();
        assert_eq!(report.dropped, 1);
    }

    #[tokio::test]
    async fn test_stream_reset_only_affects_that_topic() {
        let state = AppState::new(Settings::default());
        let (mut client, _control, _) = connect(&state, request("a,b")).await;

        state.dispatcher.publish("a", "a1", DeliveryMode::Reliable).unwrap();
        let (mut a, _) = accept(&mut client).await;
        next_frame(&mut a).await;
        assert_eq!(&next_frame(&mut a).await[..], b"a1");

        // Client resets the stream for topic a
        drop(a);

        state.dispatcher.publish("a", "a2", DeliveryMode::Reliable).unwrap();
        state.dispatcher.publish("b", "b1", DeliveryMode::Reliable).unwrap();
        state.dispatcher.publish("a", "a3", DeliveryMode::Reliable).unwrap();

        let mut streams = accept_topics(&mut client, 2).await;
        assert_eq!(&next_frame(streams.get_mut("b").unwrap()).await[..], b"b1");
        assert_eq!(&next_frame(streams.get_mut("a").unwrap()).await[..], b"a3");

        let id = state.registry.resolve("a")[0];
        assert_eq!(state.supervisor.get(id).unwrap().state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_stalled_topic_stream_does_not_block_session() {
        let state = AppState::new(Settings::default());
        let (mut client, _control, hello) = connect(&state, request("a,b")).await;
        let ServerMessage::Connected { connection_id, .. } = hello else {
            panic!("expected connected, got {:?}", hello);
        };

        // Never read: 8 x 16 KiB fills the stream buffer and parks its writer
        for _ in 0..8 {
            let report = state
                .dispatcher
                .publish("a", vec![b'x'; 16 * 1024], DeliveryMode::Reliable)
                .unwrap();
            assert_eq!(report.delivered, 1);
        }
        let (_stalled, _) = accept(&mut client).await;

        state.dispatcher.publish("b", "tick", DeliveryMode::BestEffort).unwrap();
        let datagram = tokio::time::timeout(Duration::from_secs(2), client.recv_datagram())
            .await
            .expect("datagram path blocked");
        assert_eq!(datagram, Some(Bytes::from_static(b"tick")));

        state.dispatcher.publish("b", "b1", DeliveryMode::Reliable).unwrap();
        let (mut b, _) = accept(&mut client).await;
        assert_eq!(&next_frame(&mut b).await[..], br#"{"topic":"b"}"#);
        assert_eq!(&next_frame(&mut b).await[..], b"b1");

        state
            .supervisor
            .teardown(connection_id, CloseReason::ClientDisconnect);
        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("session not closed after teardown");
        assert_eq!(
            client.close_info().map(|(code, _)| code),
            Some(close_code::NORMAL)
        );
    }

    #[tokio::test]
    async fn test_client_control_stream() {
        let handler = Arc::new(RecordingHandler::default());
        let state = AppState::new(Settings::default()).with_inbound_handler(handler.clone());
        let (client, _control, hello) = connect(&state, SessionRequest::default()).await;
        let ServerMessage::Connected { connection_id, .. } = hello else {
            panic!("expected connected, got {:?}", hello);
        };

        let (mut reader, mut writer) = framed(client.open_stream().unwrap());
        writer
            .send(Bytes::from_static(br#"{"type":"Subscribe","payload":{"topics":["x"]}}"#))
            .await
            .unwrap();
        assert_eq!(
            next_message(&mut reader).await,
            ServerMessage::subscribed(vec!["x".into()])
        );
        assert_eq!(state.registry.resolve("x").as_slice(), &[connection_id]);

        writer
            .send(Bytes::from_static(br#"{"type":"Message","payload":{"data":[1,2]}}"#))
            .await
            .unwrap();
        assert!(client.send_datagram(Bytes::from_static(b"dgram")));

        wait_until(|| handler.messages.lock().len() == 2).await;
        let messages = handler.messages.lock();
        assert!(messages.iter().all(|(id, _)| *id == connection_id));
        assert!(messages.iter().any(|(_, p)| &p[..] == b"[1,2]"));
        assert!(messages.iter().any(|(_, p)| &p[..] == b"dgram"));
    }

    #[tokio::test]
    async fn test_malformed_control_frame_closes_session() {
        let state = AppState::new(Settings::default());
        let (client, _control, _) = connect(&state, SessionRequest::default()).await;

        let (mut reader, mut writer) = framed(client.open_stream().unwrap());
        writer.send(Bytes::from_static(b"not json")).await.unwrap();

        assert!(matches!(
            next_message(&mut reader).await,
            ServerMessage::Error { code, .. } if code == "PROTOCOL_VIOLATION"
        ));
        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .unwrap();
        assert_eq!(
            client.close_info().map(|(code, _)| code),
            Some(close_code::PROTOCOL_VIOLATION)
        );
        wait_until(|| state.supervisor.is_empty()).await;
    }

    #[tokio::test]
    async fn test_session_loss_then_resume_replays_queue() {
        let state = AppState::new(Settings::default());
        let (client, _control, hello) = connect(&state, request("prices")).await;
        let ServerMessage::Connected {
            connection_id,
            token: Some(token),
            ..
        } = hello
        else {
            panic!("expected connected, got {:?}", hello);
        };

        client.disconnect();
        wait_until(|| {
            state.supervisor.get(connection_id).map(|c| c.state())
                == Some(ConnectionState::Reconnecting)
        })
        .await;

        // Queued while no session is attached
        let report = state
            .dispatcher
            .publish("prices", r#"{"p":7}"#, DeliveryMode::Reliable)
            .unwrap();
        assert_eq!(report.delivered, 1);

        let (mut client, _control, hello) = connect(
            &state,
            SessionRequest {
                topics: None,
                resume: Some(token.clone()),
            },
        )
        .await;
        match hello {
            ServerMessage::Resumed {
                connection_id: resumed_id,
                token: new_token,
                replayed,
                ..
            } => {
                assert_eq!(resumed_id, connection_id);
                assert_ne!(new_token, token);
                assert!(replayed);
            }
            other => panic!("expected resumed, got {:?}", other),
        }

        let (mut prices, _) = accept(&mut client).await;
        assert_eq!(&next_frame(&mut prices).await[..], br#"{"topic":"prices"}"#);
        assert_eq!(&next_frame(&mut prices).await[..], br#"{"p":7}"#);
        assert_eq!(state.supervisor.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_topic_rejects_session() {
        let state = AppState::new(Settings::default());
        let (session, client) = pair(None);
        let result = serve_session(state.clone(), session, request("no spaces")).await;
        assert!(matches!(result, Err(GatewayError::InvalidTopic(_))));
        assert_eq!(
            client.close_info().map(|(code, _)| code),
            Some(close_code::HANDSHAKE_FAILED)
        );
        assert!(state.supervisor.is_empty());
    }
}
