//! Topic inspection endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::registry::TopicInfo;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct TopicListResponse {
    pub topics: Vec<TopicInfo>,
    pub total_topics: usize,
}

#[derive(Debug, Serialize)]
pub struct TopicDetailResponse {
    pub name: String,
    pub subscriber_count: usize,
    /// Sequence number of the last event published to the topic, 0 if none
    pub last_seq: u64,
}

/// GET /api/v1/topics - List topics with at least one subscriber, by name
pub async fn list_topics(State(state): State<AppState>) -> Json<TopicListResponse> {
    let topics = state.registry.list_topics();
    let total_topics = topics.len();

    Json(TopicListResponse {
        topics,
        total_topics,
    })
}

/// GET /api/v1/topics/{topic} - Topic details
pub async fn get_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Json<TopicDetailResponse>> {
    let subscriber_count = state.registry.subscriber_count(&topic);
    let last_seq = state.dispatcher.last_seq(&topic);
    if subscriber_count == 0 && last_seq == 0 {
        return Err(AppError::NotFound(format!(
            "Topic '{}' has no subscribers and no events",
            topic
        )));
    }

    Ok(Json(TopicDetailResponse {
        name: topic,
        subscriber_count,
        last_seq,
    }))
}
