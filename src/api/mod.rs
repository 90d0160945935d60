//! API layer - HTTP endpoint handlers organized by domain.

mod connection;
mod health;
mod metrics;
mod routes;
mod topics;

pub use connection::{
    add_subscriptions, get_connection, remove_subscriptions, ConnectionDetailResponse,
    RejectedTopic, SubscriptionRequest, SubscriptionResponse,
};
pub use health::{health, stats, HealthResponse, StatsResponse};
pub(crate) use metrics::update_gauges;
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
pub use topics::{get_topic, list_topics, TopicDetailResponse, TopicListResponse};
