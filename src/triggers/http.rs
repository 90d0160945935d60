//! HTTP event source: `POST /api/v1/publish` and its batch variant

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::dispatcher::DispatchReport;
use crate::error::{AppError, Result};
use crate::event::{DeliveryMode, EventBuilder, EventDraft};
use crate::server::AppState;

/// Largest accepted batch
pub const MAX_BATCH_SIZE: usize = 100;

/// One event to publish. `data` becomes the event body verbatim.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub data: Box<RawValue>,
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Rendered as the SSE `event:` field
    pub event_type: Option<String>,
}

impl PublishRequest {
    pub fn into_draft(self) -> EventDraft {
        let body = self.data.get().as_bytes().to_vec();
        let mut builder = EventBuilder::new(self.topic).body(body).mode(self.mode);
        if let Some(event_type) = self.event_type {
            builder = builder.event_type(event_type);
        }
        builder.build()
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub success: bool,
    pub topic: String,
    pub seq: u64,
    pub subscribers: usize,
    pub delivered: usize,
    pub dropped: usize,
    /// Waiting in a retry backlog
    pub deferred: usize,
    pub timestamp: DateTime<Utc>,
}

impl From<DispatchReport> for PublishResponse {
    fn from(report: DispatchReport) -> Self {
        Self {
            success: true,
            topic: report.topic,
            seq: report.seq,
            subscribers: report.subscribers,
            delivered: report.delivered,
            dropped: report.dropped,
            deferred: report.deferred,
            timestamp: Utc::now(),
        }
    }
}

/// Publish one event to a topic
#[tracing::instrument(
    name = "http.publish",
    skip(state, request),
    fields(topic = %request.topic, mode = %request.mode.as_str())
)]
pub async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>> {
    let report = state.dispatcher.publish_event(request.into_draft())?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
pub struct BatchPublishRequest {
    pub events: Vec<PublishRequest>,
    /// Stop at the first failing item instead of publishing the rest
    #[serde(default)]
    pub stop_on_error: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub topic: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items never attempted because of `stop_on_error`
    pub skipped: usize,
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchPublishResponse {
    pub results: Vec<BatchItemResult>,
    pub summary: BatchSummary,
}

/// Publish several events in order. Events on the same topic keep their
/// order within the batch.
#[tracing::instrument(
    name = "http.publish_batch",
    skip(state, request),
    fields(batch_size = request.events.len())
)]
pub async fn publish_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchPublishRequest>,
) -> Result<Json<BatchPublishResponse>> {
    if request.events.is_empty() {
        return Err(AppError::Validation("batch is empty".into()));
    }
    if request.events.len() > MAX_BATCH_SIZE {
        return Err(AppError::Validation(format!(
            "batch size {} exceeds maximum of {}",
            request.events.len(),
            MAX_BATCH_SIZE
        )));
    }

    let mut summary = BatchSummary {
        total: request.events.len(),
        ..Default::default()
    };
    let mut results = Vec::with_capacity(request.events.len());

    for (index, item) in request.events.into_iter().enumerate() {
        let topic = item.topic.clone();
        match state.dispatcher.publish_event(item.into_draft()) {
            Ok(report) => {
                summary.succeeded += 1;
                summary.delivered += report.delivered;
                results.push(BatchItemResult {
                    index,
                    topic,
                    success: true,
                    seq: Some(report.seq),
                    delivered: report.delivered,
                    error: None,
                });
            }
            Err(e) => {
                summary.failed += 1;
                results.push(BatchItemResult {
                    index,
                    topic,
                    success: false,
                    seq: None,
                    delivered: 0,
                    error: Some(e.to_string()),
                });
                if request.stop_on_error {
                    break;
                }
            }
        }
    }
    summary.skipped = summary.total - results.len();

    tracing::info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Batch published"
    );

    Ok(Json(BatchPublishResponse { results, summary }))
}
