//! Registry statistics and info structures

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection::ConnectionId;

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub attached_connections: usize,
    pub topics: usize,
    pub subscriptions: usize,
}

/// Topic information
#[derive(Debug, Clone, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub subscriber_count: usize,
}

/// A single (topic, connection) subscription
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub topic: String,
    pub connection_id: ConnectionId,
    pub created_at: DateTime<Utc>,
}
