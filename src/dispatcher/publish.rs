use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::connection::{CloseReason, ConnectionId, ConnectionState, SendError, SendOutcome};
use crate::error::GatewayError;
use crate::event::{DeliveryMode, Event, EventDraft};
use crate::metrics::DeliveryMetrics;
use crate::registry::is_valid_topic;
use crate::supervisor::Supervisor;

use super::retry::{ParkReason, Parking, RetryBacklog};
use super::stats::{DispatchReport, DispatcherStats, DispatcherStatsSnapshot};

/// Fans published events out to every subscribed connection
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    /// topic -> last assigned sequence number
    sequencers: DashMap<String, Arc<Mutex<u64>>>,
    backlog: RetryBacklog,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let stats = Arc::new(DispatcherStats::default());
        Self {
            backlog: RetryBacklog::new(supervisor.clone(), stats.clone()),
            supervisor,
            sequencers: DashMap::new(),
            stats,
        }
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Reliable events currently waiting for a retry
    pub fn retry_backlog(&self) -> usize {
        self.backlog.len()
    }

    /// Last sequence number assigned on `topic`, 0 if nothing was published
    pub fn last_seq(&self, topic: &str) -> u64 {
        self.sequencers
            .get(topic)
            .map(|seq| *seq.lock())
            .unwrap_or(0)
    }

    pub fn publish(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        mode: DeliveryMode,
    ) -> Result<DispatchReport, GatewayError> {
        self.publish_event(EventDraft::new(topic, body, mode))
    }

    /// Stamp the event with the topic's next sequence number and offer it to
    /// every subscriber.
    ///
    /// Never waits on a connection: each `send` is a non-blocking enqueue, and
    /// reliable events that meet a full queue are parked for a later retry on
    /// that connection only.
    #[tracing::instrument(
        name = "dispatcher.publish",
        skip(self, draft),
        fields(topic = %draft.topic, mode = %draft.mode.as_str())
    )]
    pub fn publish_event(&self, draft: EventDraft) -> Result<DispatchReport, GatewayError> {
        if !is_valid_topic(&draft.topic) {
            return Err(GatewayError::InvalidTopic(draft.topic));
        }

        let start = Instant::now();
        let sequencer = self
            .sequencers
            .entry(draft.topic.clone())
            .or_default()
            .clone();

        // Held for the whole fan-out so events of one topic enter every queue
        // in sequence order. Nothing below awaits.
        let mut last_seq = sequencer.lock();
        *last_seq += 1;
        let event = Arc::new(draft.stamp(*last_seq));
        let report = self.fan_out(&event);
        drop(last_seq);

        self.stats.record(&report);
        DeliveryMetrics::record_published(event.mode);
        DeliveryMetrics::record_outcome("ack", report.delivered as u64);
        DeliveryMetrics::record_outcome("dropped", report.dropped as u64);
        DeliveryMetrics::record_outcome("backpressure", report.deferred as u64);
        DeliveryMetrics::record_outcome("closed", report.closed as u64);
        DeliveryMetrics::record_latency(start.elapsed().as_secs_f64());

        tracing::debug!(
            seq = report.seq,
            subscribers = report.subscribers,
            delivered = report.delivered,
            dropped = report.dropped,
            deferred = report.deferred,
            "Event dispatched"
        );
        Ok(report)
    }

    fn fan_out(&self, event: &Arc<Event>) -> DispatchReport {
        let subscribers = self.supervisor.registry().resolve(&event.topic);
        let mut report = DispatchReport {
            topic: event.topic.clone(),
            seq: event.seq,
            mode: event.mode,
            subscribers: subscribers.len(),
            ..Default::default()
        };

        for id in subscribers {
            // Torn down after the snapshot was taken
            let Some(connection) = self.supervisor.get(id) else {
                report.skipped += 1;
                continue;
            };

            // Keep reliable events behind anything already waiting to retry
            if event.is_reliable() && self.backlog.has_backlog(id) {
                self.defer(id, event, ParkReason::Ordering, &mut report);
                continue;
            }

            match connection.send(event) {
                Ok(SendOutcome::Ack) => report.delivered += 1,
                Ok(SendOutcome::Dropped) => {
                    report.dropped += 1;
                    tracing::trace!(connection_id = %id, seq = event.seq, "Best-effort event dropped");
                }
                Err(SendError::Backpressure) => {
                    self.defer(id, event, ParkReason::Backpressure, &mut report)
                }
                Err(SendError::Closed) => {
                    if connection.state() == ConnectionState::Connecting {
                        report.skipped += 1;
                        continue;
                    }
                    report.closed += 1;
                    let reason = connection
                        .close_reason()
                        .unwrap_or(CloseReason::TransportError);
                    self.supervisor.teardown(id, reason);
                }
            }
        }

        report
    }

    fn defer(
        &self,
        id: ConnectionId,
        event: &Arc<Event>,
        reason: ParkReason,
        report: &mut DispatchReport,
    ) {
        match self.backlog.park(id, event.clone(), reason) {
            Parking::Parked => report.deferred += 1,
            Parking::Rejected => {
                report.dropped += 1;
                self.stats
                    .retry_dropped
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    connection_id = %id,
                    seq = event.seq,
                    "Reliable event dropped, retry backlog unavailable"
                );
            }
        }
    }
}
