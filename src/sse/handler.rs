//! SSE handler implementation.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::Stream;
use serde::Deserialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::connection::{
    Capabilities, CloseReason, Connection, ConnectionId, ConnectionState, LeasedReceiver,
    TransportKind,
};
use crate::error::{AppError, GatewayError};
use crate::metrics::HeartbeatMetrics;
use crate::protocol::{parse_topic_list, validate_topics, ServerMessage};
use crate::server::AppState;
use crate::supervisor::{ContinuationToken, Supervisor};

use super::frame;

/// Query parameters for the SSE endpoint
#[derive(Debug, Default, Deserialize)]
pub struct SseQuery {
    /// Comma-separated topics
    pub topics: Option<String>,
    /// Continuation token, for clients that cannot set `Last-Event-ID`
    pub resume: Option<String>,
}

/// Open (or resume) an event stream
#[tracing::instrument(
    name = "sse.connect",
    skip(state, query, headers),
    fields(resuming = tracing::field::Empty)
)]
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let topics = parse_topic_list(query.topics.as_deref());
    validate_topics(&topics, state.settings.gateway.max_subscriptions_per_connection)?;

    let presented = extract_resume_token(&query, &headers);
    tracing::Span::current().record("resuming", presented.is_some());

    let (connection, first_frame) = match presented.and_then(|t| try_resume(&state, &t)) {
        Some(resumed) => resumed,
        None => connect(&state)?,
    };
    let id = connection.id();

    for topic in &topics {
        if let Err(e) = state.registry.subscribe(topic, id) {
            tracing::warn!(connection_id = %id, topic = %topic, error = %e, "SSE subscribe failed");
        }
    }

    let Some(lease) = connection.lease_reliable() else {
        state.supervisor.teardown(id, CloseReason::HandshakeFailed);
        return Err(GatewayError::HandshakeFailed("stream already attached".into()).into());
    };

    tracing::info!(connection_id = %id, topics = ?topics, "SSE stream established");

    let guard = StreamGuard {
        lease: Some(lease),
        supervisor: state.supervisor.clone(),
        connection,
    };
    let stream = event_stream(guard, first_frame, state.settings.gateway.heartbeat_interval());

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // Disable proxy buffering (nginx)
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// `?resume=` wins over `Last-Event-ID`
fn extract_resume_token(query: &SseQuery, headers: &HeaderMap) -> Option<ContinuationToken> {
    let raw = query.resume.clone().or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    })?;
    raw.parse().ok()
}

/// A failed resume is not fatal: the client falls back to a fresh stream
/// and learns about the gap from the new `connected` frame.
fn try_resume(state: &AppState, token: &ContinuationToken) -> Option<(Arc<Connection>, Bytes)> {
    match state.supervisor.resume(token, TransportKind::Sse) {
        Ok(resumed) => {
            let id = resumed.connection.id();
            let token = resumed.token.to_string();
            let msg = ServerMessage::Resumed {
                connection_id: id,
                token: token.clone(),
                replayed: resumed.replayed,
                discarded: resumed.discarded,
            };
            let frame = control_frame(&token, "resumed", &msg);
            Some((resumed.connection, frame))
        }
        Err(e) => {
            tracing::debug!(error = %e, "SSE resume rejected, opening a fresh stream");
            None
        }
    }
}

fn connect(state: &AppState) -> Result<(Arc<Connection>, Bytes), AppError> {
    let (connection, token) = state
        .supervisor
        .accept(TransportKind::Sse, Capabilities::ReliableOnly)?;
    let id = connection.id();

    // Plain HTTP response; nothing left to negotiate
    if let Err(e) = state.supervisor.open(id) {
        state.supervisor.teardown(id, CloseReason::HandshakeFailed);
        return Err(e.into());
    }

    let token = token.to_string();
    let msg = ServerMessage::Connected {
        connection_id: id,
        transport: TransportKind::Sse,
        token: Some(token.clone()),
    };
    Ok((connection, control_frame(&token, "connected", &msg)))
}

/// Control frames carry the continuation token as the event id, so the
/// browser replays it as `Last-Event-ID` on reconnect.
fn control_frame(token: &str, event_type: &str, msg: &ServerMessage) -> Bytes {
    let data = msg.to_json().unwrap_or_else(|_| "{}".to_string());
    frame::encode_frame(Some(token), Some(event_type), &data)
}

fn event_stream(
    mut guard: StreamGuard,
    first_frame: Bytes,
    heartbeat_interval: std::time::Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    async_stream::stream! {
        yield Ok(first_frame);

        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let Some(lease) = guard.lease.as_mut() else { break };
            let next = tokio::select! {
                biased;
                // None once the supervisor closes the connection
                event = lease.recv() => event.map(|event| frame::encode_event(&event)),
                _ = heartbeat.tick() => {
                    guard.connection.touch();
                    HeartbeatMetrics::record_sent(TransportKind::Sse);
                    Some(frame::heartbeat())
                }
            };
            match next {
                Some(bytes) => yield Ok(bytes),
                None => break,
            }
        }
    }
}

/// Owns the queue lease for the lifetime of the response body. Dropping it
/// (client went away, or the stream ended) returns the lease, then either
/// suspends the connection for a resume or finishes its teardown.
struct StreamGuard {
    lease: Option<LeasedReceiver>,
    supervisor: Arc<Supervisor>,
    connection: Arc<Connection>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        // Hand the queue back before anyone can resume
        self.lease.take();

        let id: ConnectionId = self.connection.id();
        match self.connection.state() {
            ConnectionState::Open => {
                self.supervisor.suspend(id);
            }
            ConnectionState::Closing => {
                let reason = self
                    .connection
                    .close_reason()
                    .unwrap_or(CloseReason::ClientDisconnect);
                self.supervisor.teardown(id, reason);
            }
            _ => {}
        }
        tracing::info!(connection_id = %id, state = %self.connection.state(), "SSE stream ended");
    }
}
