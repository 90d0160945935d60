//! End-to-end gateway tests
//!
//! These drive the public API the way deployments do: the axum router for
//! SSE and the HTTP publish path, a real TCP socket for WebSocket, and the
//! in-process session pair for WebTransport. No Redis required.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tower::ServiceExt;

use ara_realtime_gateway::config::Settings;
use ara_realtime_gateway::connection::{
    Capabilities, CloseReason, Connection, ConnectionState, LeasedReceiver, SendError,
    SendOutcome, TransportKind,
};
use ara_realtime_gateway::event::{DeliveryMode, Event, EventBuilder};
use ara_realtime_gateway::server::{create_app, AppState};
use ara_realtime_gateway::webtransport::{memory, serve_session, SessionRequest};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Open connections straight on the supervisor, subscribed to `topic`
fn subscribers(
    state: &AppState,
    kind: TransportKind,
    topic: &str,
    count: usize,
) -> Vec<(Arc<Connection>, LeasedReceiver)> {
    (0..count)
        .map(|_| {
            let (conn, _token) = state
                .supervisor
                .accept(kind, Capabilities::ReliableOnly)
                .unwrap();
            state.supervisor.open(conn.id()).unwrap();
            state.registry.subscribe(topic, conn.id()).unwrap();
            let lease = conn.lease_reliable().unwrap();
            (conn, lease)
        })
        .collect()
}

// ============================================================================
// Minimal WebSocket client over a raw socket
// ============================================================================

async fn ws_connect(addr: std::net::SocketAddr, path: &str) -> BufReader<TcpStream> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    assert!(status.contains("101"), "unexpected upgrade response: {status}");
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line == "\r\n" {
            break;
        }
    }
    reader
}

/// Next text frame from the server, skipping pings
async fn ws_next_text(reader: &mut BufReader<TcpStream>) -> Value {
    loop {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await.unwrap();
        let opcode = head[0] & 0x0f;
        let len = match head[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                reader.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                reader.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.unwrap();

        if opcode == 0x1 {
            return serde_json::from_slice(&payload).unwrap();
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_prices_reach_sse_websocket_and_webtransport() {
    let state = AppState::new(Settings::default());
    let app = create_app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = app.clone();
    tokio::spawn(async move { axum::serve(listener, server).await });

    // SSE
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sse?topics=prices")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut sse = response.into_body().into_data_stream();
    let connected = sse.next().await.unwrap().unwrap();
    assert!(std::str::from_utf8(&connected).unwrap().contains("event: connected"));

    // WebSocket
    let mut ws = ws_connect(addr, "/ws?topics=prices").await;
    assert_eq!(ws_next_text(&mut ws).await["type"], "connected");
    assert_eq!(ws_next_text(&mut ws).await["type"], "subscribed");

    // WebTransport
    let (session, mut wt) = memory::pair(Some(1200));
    tokio::spawn(serve_session(
        state.clone(),
        session,
        SessionRequest {
            topics: Some("prices".into()),
            resume: None,
        },
    ));
    let control = wt.accept_stream().await.unwrap();
    let mut control = FramedRead::new(control, LengthDelimitedCodec::new());
    let hello: Value = serde_json::from_slice(&control.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(hello["type"], "connected");

    wait_until(|| state.registry.subscriber_count("prices") == 3).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/publish")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"topic":"prices","data":{"price":100}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(report["subscribers"], 3);
    assert_eq!(report["delivered"], 3);

    let frame = tokio::time::timeout(TIMEOUT, sse.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(&frame[..], b"data: {\"price\":100}\n\n");

    let envelope = tokio::time::timeout(TIMEOUT, ws_next_text(&mut ws)).await.unwrap();
    assert_eq!(envelope["type"], "event");
    assert_eq!(envelope["topic"], "prices");
    assert_eq!(envelope["data"]["price"], 100);

    let stream = tokio::time::timeout(TIMEOUT, wt.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let mut prices = FramedRead::new(stream, LengthDelimitedCodec::new());
    let header = prices.next().await.unwrap().unwrap();
    assert_eq!(&header[..], br#"{"topic":"prices"}"#);
    let body = prices.next().await.unwrap().unwrap();
    assert_eq!(&body[..], br#"{"price":100}"#);
}

#[tokio::test]
async fn test_reliable_events_arrive_once_in_order() {
    let state = AppState::new(Settings::default());
    let mut subs = subscribers(&state, TransportKind::WebSocket, "orders", 3);

    for i in 1..=40 {
        let report = state
            .dispatcher
            .publish("orders", format!(r#"{{"n":{i}}}"#), DeliveryMode::Reliable)
            .unwrap();
        assert_eq!(report.delivered, 3);
    }

    for (_, lease) in subs.iter_mut() {
        for expected in 1..=40u64 {
            let event = lease.recv().await.unwrap();
            assert_eq!(event.seq, expected);
        }
        assert!(lease.try_recv().is_none());
    }
}

#[tokio::test]
async fn test_stalled_best_effort_subscriber_does_not_delay_fan_out() {
    let mut settings = Settings::default();
    settings.gateway.outbound_queue_capacity = 4;
    let state = AppState::new(settings);

    // Never drained
    let _stalled = subscribers(&state, TransportKind::WebSocket, "ticks", 1);
    let mut fast = subscribers(&state, TransportKind::WebSocket, "ticks", 1);
    let (_, fast_lease) = &mut fast[0];

    let started = std::time::Instant::now();
    let mut dropped = 0;
    for i in 0..100 {
        let draft = EventBuilder::new("ticks").body(format!("{i}")).best_effort().build();
        let report = state.dispatcher.publish_event(draft).unwrap();
        assert_eq!(report.deferred, 0);
        dropped += report.dropped;
        assert_eq!(fast_lease.recv().await.unwrap().seq, i + 1);
    }

    assert_eq!(dropped, 100 - 4);
    assert_eq!(state.dispatcher.retry_backlog(), 0);
    assert!(started.elapsed() < Duration::from_secs(2));
}

fn bulk_event(seq: u64) -> Arc<Event> {
    Arc::new(Event {
        topic: "bulk".into(),
        seq,
        timestamp: Utc::now(),
        event_type: None,
        body: Bytes::from_static(b"x"),
        mode: DeliveryMode::Reliable,
    })
}

#[tokio::test]
async fn test_capacity_ten_queue_reports_backpressure() {
    let mut settings = Settings::default();
    settings.gateway.outbound_queue_capacity = 10;
    let state = AppState::new(settings);
    let subs = subscribers(&state, TransportKind::WebSocket, "bulk", 1);
    let (conn, _lease) = &subs[0];

    for seq in 1..=10 {
        assert_eq!(conn.send(&bulk_event(seq)), Ok(SendOutcome::Ack));
    }
    assert_eq!(conn.send(&bulk_event(11)), Err(SendError::Backpressure));
    assert_eq!(conn.pending(), 10);

    // Through the dispatcher the same overflow is parked, not dropped
    let report = state
        .dispatcher
        .publish("bulk", "x", DeliveryMode::Reliable)
        .unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.dropped, 0);
}

#[tokio::test]
async fn test_disconnect_mid_fan_out_keeps_other_deliveries() {
    let state = AppState::new(Settings::default());
    let mut subs = subscribers(&state, TransportKind::Sse, "alerts", 5);

    // Gone, but the registry has not heard yet
    let (gone, _) = &subs[2];
    gone.close(CloseReason::ClientDisconnect);
    let gone_id = gone.id();

    let report = state
        .dispatcher
        .publish("alerts", r#"{"level":"high"}"#, DeliveryMode::Reliable)
        .unwrap();
    assert_eq!(report.subscribers, 5);
    assert_eq!(report.delivered, 4);
    assert_eq!(report.closed, 1);

    for (i, (conn, lease)) in subs.iter_mut().enumerate() {
        if i == 2 {
            assert!(lease.recv().await.is_none());
            assert_eq!(conn.state(), ConnectionState::Closed);
            continue;
        }
        let event = lease.recv().await.unwrap();
        assert_eq!(event.body, Bytes::from_static(br#"{"level":"high"}"#));
        assert!(lease.try_recv().is_none());
    }

    assert!(!state.registry.resolve("alerts").contains(&gone_id));
    assert!(state.supervisor.get(gone_id).is_none());
}

#[tokio::test]
async fn test_sse_only_accepts_get() {
    let app = create_app(AppState::new(Settings::default()));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sse")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
