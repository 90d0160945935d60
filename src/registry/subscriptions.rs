use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use smallvec::SmallVec;

use crate::connection::ConnectionId;
use crate::error::GatewayError;
use crate::metrics::SubscriptionMetrics;

use super::stats::{RegistryStats, Subscription, TopicInfo};

/// Maximum topic name length in bytes
pub const MAX_TOPIC_LEN: usize = 128;

/// Point-in-time subscriber snapshot returned by `resolve`
pub type Subscribers = SmallVec<[ConnectionId; 8]>;

/// Topic name validation: 1-128 chars of alphanumerics, `-`, `_`, `.` and `:`
pub fn is_valid_topic(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_TOPIC_LEN {
        return false;
    }

    name.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == ':')
}

/// Topic to connection-set mapping.
///
/// Both directions live in sharded `DashMap`s so subscribe, unsubscribe and
/// resolve on different topics never contend. Guards are always taken in
/// connection-entry then topic-entry order, and never held across an await.
pub struct SubscriptionRegistry {
    /// topic -> (connection_id -> subscribed_at)
    topics: DashMap<String, HashMap<ConnectionId, DateTime<Utc>>>,
    /// connection_id -> topics; presence means the connection is attached
    connections: DashMap<ConnectionId, HashSet<String>>,
    max_subscriptions_per_connection: usize,
}

impl SubscriptionRegistry {
    pub fn new(max_subscriptions_per_connection: usize) -> Self {
        Self {
            topics: DashMap::new(),
            connections: DashMap::new(),
            max_subscriptions_per_connection,
        }
    }

    /// Make a connection eligible for subscriptions
    pub fn attach(&self, connection_id: ConnectionId) {
        self.connections.entry(connection_id).or_default();
    }

    pub fn is_attached(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// Remove a connection and every subscription it holds, returning the
    /// topics it was subscribed to.
    ///
    /// The reverse entry goes first, so a concurrent `subscribe` either
    /// completes before it (and is cleaned up here) or fails with
    /// `UnknownConnection`.
    pub fn detach(&self, connection_id: ConnectionId) -> Vec<String> {
        let Some((_, topics)) = self.connections.remove(&connection_id) else {
            return Vec::new();
        };

        let mut removed_topics = 0;
        for topic in &topics {
            if let Some(mut subscribers) = self.topics.get_mut(topic) {
                subscribers.remove(&connection_id);
            }
            if self
                .topics
                .remove_if(topic, |_, subscribers| subscribers.is_empty())
                .is_some()
            {
                removed_topics += 1;
            }
        }

        SubscriptionMetrics::record_unsubscribed(topics.len(), removed_topics);
        tracing::debug!(
            connection_id = %connection_id,
            topics = topics.len(),
            "Connection detached from registry"
        );

        topics.into_iter().collect()
    }

    /// Subscribe a connection to a topic. Returns `false` if it was already
    /// subscribed.
    pub fn subscribe(&self, topic: &str, connection_id: ConnectionId) -> Result<bool, GatewayError> {
        if !is_valid_topic(topic) {
            return Err(GatewayError::InvalidTopic(topic.to_string()));
        }

        let mut owned = self
            .connections
            .get_mut(&connection_id)
            .ok_or(GatewayError::UnknownConnection(connection_id))?;

        if owned.contains(topic) {
            return Ok(false);
        }
        if owned.len() >= self.max_subscriptions_per_connection {
            return Err(GatewayError::SubscriptionLimit {
                current: owned.len(),
                max: self.max_subscriptions_per_connection,
            });
        }

        owned.insert(topic.to_string());
        let new_topic = {
            let mut subscribers = self.topics.entry(topic.to_string()).or_default();
            let new_topic = subscribers.is_empty();
            subscribers.insert(connection_id, Utc::now());
            new_topic
        };
        drop(owned);

        SubscriptionMetrics::record_subscribed(new_topic);
        tracing::debug!(connection_id = %connection_id, topic = %topic, "Subscribed to topic");
        Ok(true)
    }

    /// Returns `true` if a subscription was removed
    pub fn unsubscribe(&self, topic: &str, connection_id: ConnectionId) -> bool {
        let Some(mut owned) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        if !owned.remove(topic) {
            return false;
        }

        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&connection_id);
        }
        let topic_removed = self
            .topics
            .remove_if(topic, |_, subscribers| subscribers.is_empty())
            .is_some();
        drop(owned);

        SubscriptionMetrics::record_unsubscribed(1, usize::from(topic_removed));
        tracing::debug!(connection_id = %connection_id, topic = %topic, "Unsubscribed from topic");
        true
    }

    /// Snapshot of the connections subscribed to `topic`
    pub fn resolve(&self, topic: &str) -> Subscribers {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Sorted topics a connection is subscribed to
    pub fn topics_of(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .connections
            .get(&connection_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn subscription(&self, topic: &str, connection_id: ConnectionId) -> Option<Subscription> {
        self.topics.get(topic).and_then(|subscribers| {
            subscribers
                .get(&connection_id)
                .map(|created_at| Subscription {
                    topic: topic.to_string(),
                    connection_id,
                    created_at: *created_at,
                })
        })
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn list_topics(&self) -> Vec<TopicInfo> {
        let mut topics: Vec<TopicInfo> = self
            .topics
            .iter()
            .map(|entry| TopicInfo {
                name: entry.key().clone(),
                subscriber_count: entry.value().len(),
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }

    pub fn stats(&self) -> RegistryStats {
        let subscriptions = self.topics.iter().map(|entry| entry.value().len()).sum();
        RegistryStats {
            attached_connections: self.connections.len(),
            topics: self.topics.len(),
            subscriptions,
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
