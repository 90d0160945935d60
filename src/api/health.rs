//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::dispatcher::DispatcherStatsSnapshot;
use crate::metrics;
use crate::registry::RegistryStats;
use crate::server::AppState;
use crate::supervisor::SupervisorStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
    pub redis: RedisHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub max: usize,
    pub topics_count: usize,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub enabled: bool,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub connections: SupervisorStats,
    pub subscriptions: RegistryStats,
    pub dispatch: DispatcherStatsSnapshot,
    pub retry_backlog: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis_enabled = state.settings.redis.enabled;
    let redis_connected = metrics::REDIS_CONNECTION_STATUS.get() == 1;

    let status = if state.supervisor.is_shutting_down() {
        "shutting_down"
    } else if redis_enabled && !redis_connected {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connections: ConnectionHealthResponse {
            total: state.supervisor.len(),
            max: state.settings.gateway.max_connections,
            topics_count: state.registry.stats().topics,
        },
        redis: RedisHealthResponse {
            enabled: redis_enabled,
            connected: redis_connected,
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connections: state.supervisor.stats(),
        subscriptions: state.registry.stats(),
        dispatch: state.dispatcher.stats(),
        retry_backlog: state.dispatcher.retry_backlog(),
    })
}
