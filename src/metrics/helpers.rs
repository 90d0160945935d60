//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::connection::{CloseReason, TransportKind};
use crate::event::DeliveryMode;

use super::{
    CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPENED_TOTAL,
    CONNECTIONS_RECONNECTING, CONNECTION_DURATION, DELIVERIES_TOTAL, DISPATCH_LATENCY,
    EVENTS_PUBLISHED_TOTAL, HANDSHAKE_FAILURES_TOTAL, HEARTBEATS_SENT_TOTAL,
    INBOUND_MESSAGES_TOTAL, PROTOCOL_VIOLATIONS_TOTAL, REDIS_CONNECTION_STATUS,
    REDIS_MESSAGES_RECEIVED, REDIS_RECONNECTIONS_TOTAL, RESUMES_TOTAL, RETRY_BACKLOG,
    STREAM_RESETS_TOTAL, SUBSCRIPTIONS_ACTIVE, SWEEP_DURATION_MS, SWEEP_RUNS_TOTAL, TOPICS_ACTIVE,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened(kind: TransportKind) {
        CONNECTIONS_OPENED_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
        CONNECTIONS_ACTIVE.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_closed(kind: TransportKind, reason: CloseReason, duration_secs: f64) {
        CONNECTIONS_CLOSED_TOTAL
            .with_label_values(&[kind.as_str(), reason.as_str()])
            .inc();
        CONNECTIONS_ACTIVE.with_label_values(&[kind.as_str()]).dec();
        CONNECTION_DURATION
            .with_label_values(&[kind.as_str()])
            .observe(duration_secs);
    }

    pub fn record_handshake_failed(kind: TransportKind) {
        HANDSHAKE_FAILURES_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    /// Record a resume attempt: `resumed`, `discarded`, `expired` or `rejected`
    pub fn record_resume(outcome: &str) {
        RESUMES_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn set_reconnecting(count: usize) {
        CONNECTIONS_RECONNECTING.set(count as i64);
    }

    /// Overwrite the active gauge, used by the periodic sweep to correct drift
    pub fn set_active(kind: TransportKind, count: usize) {
        CONNECTIONS_ACTIVE
            .with_label_values(&[kind.as_str()])
            .set(count as i64);
    }
}

/// Helper struct for recording delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_published(mode: DeliveryMode) {
        EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[mode.as_str()])
            .inc();
    }

    /// Record per-connection outcomes: `ack`, `dropped`, `backpressure`,
    /// `closed`, `retried` or `retry_dropped`
    pub fn record_outcome(outcome: &str, count: u64) {
        if count > 0 {
            DELIVERIES_TOTAL.with_label_values(&[outcome]).inc_by(count);
        }
    }

    pub fn record_latency(latency_secs: f64) {
        DISPATCH_LATENCY.observe(latency_secs);
    }

    pub fn set_retry_backlog(count: usize) {
        RETRY_BACKLOG.set(count as i64);
    }
}

/// Helper struct for recording subscription metrics
pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    pub fn record_subscribed(new_topic: bool) {
        SUBSCRIPTIONS_ACTIVE.inc();
        if new_topic {
            TOPICS_ACTIVE.inc();
        }
    }

    pub fn record_unsubscribed(count: usize, topics_removed: usize) {
        SUBSCRIPTIONS_ACTIVE.sub(count as i64);
        TOPICS_ACTIVE.sub(topics_removed as i64);
    }

    pub fn set(subscriptions: usize, topics: usize) {
        SUBSCRIPTIONS_ACTIVE.set(subscriptions as i64);
        TOPICS_ACTIVE.set(topics as i64);
    }
}

/// Helper struct for recording keepalive and maintenance metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_sent(kind: TransportKind) {
        HEARTBEATS_SENT_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_sweep(duration_ms: u64) {
        SWEEP_RUNS_TOTAL.inc();
        SWEEP_DURATION_MS.observe(duration_ms as f64);
    }
}

/// Helper struct for recording transport-level metrics
pub struct TransportMetrics;

impl TransportMetrics {
    pub fn record_protocol_violation(kind: TransportKind) {
        PROTOCOL_VIOLATIONS_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_inbound(kind: TransportKind) {
        INBOUND_MESSAGES_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_stream_reset() {
        STREAM_RESETS_TOTAL.inc();
    }
}

/// Helper struct for recording Redis trigger metrics
pub struct RedisMetrics;

impl RedisMetrics {
    pub fn set_connected(connected: bool) {
        REDIS_CONNECTION_STATUS.set(if connected { 1 } else { 0 });
    }

    pub fn record_reconnection() {
        REDIS_RECONNECTIONS_TOTAL.inc();
    }

    pub fn record_message_received() {
        REDIS_MESSAGES_RECEIVED.inc();
    }
}
