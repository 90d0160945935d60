//! Connection inspection and subscription management endpoints.
//!
//! SSE has no upstream path, so these are how an SSE client changes its
//! topics after connecting. They work for every transport.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionId, ConnectionInfo};
use crate::error::{GatewayError, Result};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct ConnectionDetailResponse {
    #[serde(flatten)]
    pub info: ConnectionInfo,
    pub topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub topics: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RejectedTopic {
    pub topic: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub connection_id: ConnectionId,
    /// Topics whose membership changed
    pub changed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedTopic>,
    /// Current topic set of the connection
    pub topics: Vec<String>,
}

/// GET /api/v1/connections/{id}
pub async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<ConnectionDetailResponse>> {
    let connection = state
        .supervisor
        .get(id)
        .ok_or(GatewayError::UnknownConnection(id))?;

    Ok(Json(ConnectionDetailResponse {
        info: connection.info(),
        topics: sorted(state.registry.topics_of(id)),
    }))
}

/// POST /api/v1/connections/{id}/subscriptions
#[tracing::instrument(name = "api.subscribe", skip(state, request), fields(connection_id = %id))]
pub async fn add_subscriptions(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>> {
    ensure_live(&state, id)?;

    let mut changed = Vec::new();
    let mut rejected = Vec::new();
    for topic in request.topics {
        match state.registry.subscribe(&topic, id) {
            Ok(true) => changed.push(topic),
            Ok(false) => {}
            Err(e) => rejected.push(RejectedTopic {
                code: e.code().to_string(),
                message: e.to_string(),
                topic,
            }),
        }
    }

    tracing::info!(added = changed.len(), rejected = rejected.len(), "Subscriptions updated");

    Ok(Json(SubscriptionResponse {
        connection_id: id,
        changed,
        rejected,
        topics: sorted(state.registry.topics_of(id)),
    }))
}

/// DELETE /api/v1/connections/{id}/subscriptions
#[tracing::instrument(name = "api.unsubscribe", skip(state, request), fields(connection_id = %id))]
pub async fn remove_subscriptions(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>> {
    ensure_live(&state, id)?;

    let changed: Vec<String> = request
        .topics
        .into_iter()
        .filter(|topic| state.registry.unsubscribe(topic, id))
        .collect();

    Ok(Json(SubscriptionResponse {
        connection_id: id,
        changed,
        rejected: Vec::new(),
        topics: sorted(state.registry.topics_of(id)),
    }))
}

/// Closing connections no longer take subscription changes
fn ensure_live(state: &AppState, id: ConnectionId) -> std::result::Result<(), GatewayError> {
    let connection = state
        .supervisor
        .get(id)
        .ok_or(GatewayError::UnknownConnection(id))?;
    if connection.state().is_closing() || !state.registry.is_attached(id) {
        return Err(GatewayError::Closed);
    }
    Ok(())
}

fn sorted(mut topics: Vec<String>) -> Vec<String> {
    topics.sort();
    topics
}
