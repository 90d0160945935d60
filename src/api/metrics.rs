//! Prometheus metrics endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::connection::{ConnectionState, TransportKind};
use crate::metrics::{self, ConnectionMetrics, DeliveryMetrics, SubscriptionMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_gauges(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Refresh the point-in-time gauges from live state
pub(crate) fn update_gauges(state: &AppState) {
    let connections = state.supervisor.stats();
    for kind in TransportKind::ALL {
        let count = connections
            .by_transport
            .get(kind.as_str())
            .copied()
            .unwrap_or(0);
        ConnectionMetrics::set_active(kind, count);
    }
    ConnectionMetrics::set_reconnecting(
        connections
            .by_state
            .get(ConnectionState::Reconnecting.as_str())
            .copied()
            .unwrap_or(0),
    );

    let subscriptions = state.registry.stats();
    SubscriptionMetrics::set(subscriptions.subscriptions, subscriptions.topics);

    DeliveryMetrics::set_retry_backlog(state.dispatcher.retry_backlog());
}
