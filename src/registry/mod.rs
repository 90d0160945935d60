//! Subscription registry
//!
//! This module provides:
//! - Topic to connection-ID mapping with sharded locking
//! - Reverse index for atomic cleanup on teardown
//! - Topic validation and per-connection subscription limits

mod stats;
mod subscriptions;

pub use stats::{RegistryStats, Subscription, TopicInfo};
pub use subscriptions::{is_valid_topic, Subscribers, SubscriptionRegistry, MAX_TOPIC_LEN};
