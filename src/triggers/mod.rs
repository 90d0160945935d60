//! Event sources feeding the dispatcher
//!
//! - HTTP: `POST /api/v1/publish` and `POST /api/v1/publish/batch`
//! - Redis Pub/Sub, carrying the same JSON as the HTTP body

mod backoff;
mod http;
mod redis;

pub use backoff::{Backoff, BackoffConfig};
pub use http::{
    publish, publish_batch, BatchItemResult, BatchPublishRequest, BatchPublishResponse,
    BatchSummary, PublishRequest, PublishResponse, MAX_BATCH_SIZE,
};
pub use redis::{RedisSubscriber, DEFAULT_CHANNEL};
