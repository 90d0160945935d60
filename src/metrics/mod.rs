//! Prometheus metrics for the realtime gateway.
//!
//! This module provides metrics for monitoring the gateway:
//! - Connection metrics (active, opened, closed, duration, resumes)
//! - Delivery metrics (published events, per-connection outcomes, retries)
//! - Subscription metrics
//! - Keepalive and maintenance metrics
//! - Redis trigger metrics

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, DeliveryMetrics, HeartbeatMetrics, RedisMetrics,
    SubscriptionMetrics, TransportMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_gateway";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Live connections by transport
    pub static ref CONNECTIONS_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of live connections",
        &["transport"]
    ).unwrap();

    /// Connections currently inside their reconnect grace window
    pub static ref CONNECTIONS_RECONNECTING: IntGauge = register_int_gauge!(
        format!("{}_connections_reconnecting", METRIC_PREFIX),
        "Number of connections waiting to be resumed"
    ).unwrap();

    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections accepted",
        &["transport"]
    ).unwrap();

    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections torn down",
        &["transport", "reason"]
    ).unwrap();

    /// Connections rejected before reaching OPEN
    pub static ref HANDSHAKE_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handshake_failures_total", METRIC_PREFIX),
        "Total connections that failed their handshake",
        &["transport"]
    ).unwrap();

    pub static ref RESUMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_resumes_total", METRIC_PREFIX),
        "Resume attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref CONNECTION_DURATION: HistogramVec = register_histogram_vec!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "Connection lifetime in seconds",
        &["transport"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_published_total", METRIC_PREFIX),
        "Total events published",
        &["mode"]
    ).unwrap();

    /// Per-connection delivery outcomes
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Per-connection delivery outcomes",
        &["outcome"]
    ).unwrap();

    /// Time spent fanning one event out to its subscribers
    pub static ref DISPATCH_LATENCY: Histogram = register_histogram!(
        format!("{}_dispatch_latency_seconds", METRIC_PREFIX),
        "Fan-out latency in seconds",
        vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]
    ).unwrap();

    /// Events parked in retry backlogs
    pub static ref RETRY_BACKLOG: IntGauge = register_int_gauge!(
        format!("{}_retry_backlog", METRIC_PREFIX),
        "Reliable events waiting for a backpressure retry"
    ).unwrap();

    // ============================================================================
    // Subscription Metrics
    // ============================================================================

    pub static ref SUBSCRIPTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_subscriptions_active", METRIC_PREFIX),
        "Number of active (topic, connection) subscriptions"
    ).unwrap();

    pub static ref TOPICS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_topics_active", METRIC_PREFIX),
        "Number of topics with at least one subscriber"
    ).unwrap();

    // ============================================================================
    // Transport Metrics
    // ============================================================================

    pub static ref HEARTBEATS_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_heartbeats_sent_total", METRIC_PREFIX),
        "Total keepalive frames sent",
        &["transport"]
    ).unwrap();

    pub static ref SWEEP_RUNS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sweep_runs_total", METRIC_PREFIX),
        "Total maintenance sweeps"
    ).unwrap();

    pub static ref SWEEP_DURATION_MS: Histogram = register_histogram!(
        format!("{}_sweep_duration_ms", METRIC_PREFIX),
        "Maintenance sweep duration in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    ).unwrap();

    pub static ref PROTOCOL_VIOLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_protocol_violations_total", METRIC_PREFIX),
        "Total malformed inbound frames",
        &["transport"]
    ).unwrap();

    pub static ref INBOUND_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_inbound_messages_total", METRIC_PREFIX),
        "Total client messages handed to the inbound handler",
        &["transport"]
    ).unwrap();

    /// WebTransport streams dropped after a write failure
    pub static ref STREAM_RESETS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_stream_resets_total", METRIC_PREFIX),
        "Total reliable streams dropped after a write failure"
    ).unwrap();

    // ============================================================================
    // Redis Metrics
    // ============================================================================

    /// Redis connection status (1 = connected, 0 = disconnected)
    pub static ref REDIS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_redis_connection_status", METRIC_PREFIX),
        "Redis connection status (1=connected, 0=disconnected)"
    ).unwrap();

    pub static ref REDIS_RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_redis_reconnections_total", METRIC_PREFIX),
        "Total Redis reconnection attempts"
    ).unwrap();

    pub static ref REDIS_MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        format!("{}_redis_messages_received_total", METRIC_PREFIX),
        "Total messages received from Redis pub/sub"
    ).unwrap();
}
