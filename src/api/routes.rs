use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;
use crate::triggers::{publish, publish_batch};

use super::connection::{add_subscriptions, get_connection, remove_subscriptions};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::topics::{get_topic, list_topics};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                // Publishing
                .route("/publish", post(publish))
                .route("/publish/batch", post(publish_batch))
                // Topics
                .route("/topics", get(list_topics))
                .route("/topics/{topic}", get(get_topic))
                // Connections
                .route("/connections/{id}", get(get_connection))
                .route(
                    "/connections/{id}/subscriptions",
                    post(add_subscriptions).delete(remove_subscriptions),
                ),
        )
}
