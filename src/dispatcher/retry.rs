//! Per-connection backlog for reliable events that hit backpressure.
//!
//! A connection with a non-empty backlog has exactly one worker task. New
//! reliable events for that connection queue up behind the backlog, so a
//! retry can never be overtaken by a later event of the same topic.
//!
//! Each entry keeps its own deadline: an event that met backpressure is
//! retried `backpressure_retry_delay` after it was parked, and again after
//! each further refusal, until `backpressure_retry_count` retries are spent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::connection::{CloseReason, ConnectionId, ConnectionState, SendError};
use crate::event::Event;
use crate::metrics::DeliveryMetrics;
use crate::supervisor::Supervisor;

use super::stats::DispatcherStats;

struct Parked {
    event: Arc<Event>,
    /// Sends left before the event is dropped for this connection
    sends_left: u32,
    /// Earliest instant of the next send
    due: Instant,
}

/// Why an event went to the backlog instead of the outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkReason {
    /// `send` met a full queue
    Backpressure,
    /// Never tried; held back behind events already waiting
    Ordering,
}

/// Outcome of handing an event to the backlog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parking {
    Parked,
    /// Backlog full or retries disabled
    Rejected,
}

enum Step {
    /// The front entry was delivered or dropped
    Progress,
    WaitUntil(Instant),
    Closed,
    Empty,
}

#[derive(Clone)]
pub(crate) struct RetryBacklog {
    shared: Arc<Shared>,
}

struct Shared {
    supervisor: Arc<Supervisor>,
    stats: Arc<DispatcherStats>,
    queues: DashMap<ConnectionId, VecDeque<Parked>>,
    parked: AtomicUsize,
    capacity: usize,
    retry_count: u32,
    delay: Duration,
}

impl RetryBacklog {
    pub(crate) fn new(supervisor: Arc<Supervisor>, stats: Arc<DispatcherStats>) -> Self {
        let config = supervisor.config();
        let shared = Shared {
            capacity: config.retry_backlog_capacity(),
            retry_count: config.backpressure_retry_count,
            delay: config.backpressure_retry_delay(),
            supervisor,
            stats,
            queues: DashMap::new(),
            parked: AtomicUsize::new(0),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub(crate) fn has_backlog(&self, id: ConnectionId) -> bool {
        self.shared.queues.contains_key(&id)
    }

    /// Events currently waiting across all connections
    pub(crate) fn len(&self) -> usize {
        self.shared.parked.load(Ordering::Relaxed)
    }

    pub(crate) fn park(&self, id: ConnectionId, event: Arc<Event>, reason: ParkReason) -> Parking {
        let shared = &self.shared;
        if shared.retry_count == 0 {
            return Parking::Rejected;
        }
        // No runtime to retry on; give up immediately
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Parking::Rejected;
        };

        let now = Instant::now();
        let parked = match reason {
            ParkReason::Backpressure => Parked {
                event,
                sends_left: shared.retry_count,
                due: now + shared.delay,
            },
            ParkReason::Ordering => Parked {
                event,
                sends_left: shared.retry_count.saturating_add(1),
                due: now,
            },
        };

        let mut spawn_worker = false;
        {
            let mut queue = shared.queues.entry(id).or_insert_with(|| {
                spawn_worker = true;
                VecDeque::new()
            });
            if queue.len() >= shared.capacity {
                return Parking::Rejected;
            }
            queue.push_back(parked);
        }
        let parked = shared.parked.fetch_add(1, Ordering::Relaxed) + 1;
        DeliveryMetrics::set_retry_backlog(parked);

        if spawn_worker {
            let backlog = self.clone();
            runtime.spawn(async move { backlog.drain(id).await });
        }
        Parking::Parked
    }

    async fn drain(self, id: ConnectionId) {
        loop {
            match self.step(id) {
                Step::Progress => {}
                Step::WaitUntil(due) => tokio::time::sleep_until(due).await,
                Step::Closed => {
                    self.discard(id);
                    return;
                }
                Step::Empty => {
                    // Holds the shard lock, so a concurrent park either
                    // lands before this check or creates a fresh entry
                    // with its own worker.
                    if self
                        .shared
                        .queues
                        .remove_if(&id, |_, queue| queue.is_empty())
                        .is_some()
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Send the oldest parked event if it is due
    fn step(&self, id: ConnectionId) -> Step {
        let shared = &self.shared;
        let Some(connection) = shared.supervisor.get(id) else {
            return Step::Closed;
        };
        let Some(mut queue) = shared.queues.get_mut(&id) else {
            return Step::Closed;
        };
        let Some(front) = queue.front_mut() else {
            return Step::Empty;
        };
        let now = Instant::now();
        if front.due > now {
            return Step::WaitUntil(front.due);
        }

        match connection.send(&front.event) {
            Ok(_) => {
                queue.pop_front();
                drop(queue);
                self.release(1);
                shared.stats.retried.fetch_add(1, Ordering::Relaxed);
                DeliveryMetrics::record_outcome("retried", 1);
                Step::Progress
            }
            Err(SendError::Backpressure) => {
                front.sends_left = front.sends_left.saturating_sub(1);
                if front.sends_left > 0 {
                    front.due = now + shared.delay;
                    return Step::WaitUntil(front.due);
                }
                let parked = queue.pop_front();
                drop(queue);
                self.release(1);
                shared.stats.retry_dropped.fetch_add(1, Ordering::Relaxed);
                DeliveryMetrics::record_outcome("retry_dropped", 1);
                if let Some(parked) = parked {
                    tracing::debug!(
                        connection_id = %id,
                        topic = %parked.event.topic,
                        seq = parked.event.seq,
                        "Dropping reliable event after retries"
                    );
                }
                Step::Progress
            }
            Err(SendError::Closed) => {
                drop(queue);
                if connection.state() != ConnectionState::Connecting {
                    let reason = connection
                        .close_reason()
                        .unwrap_or(CloseReason::TransportError);
                    shared.supervisor.teardown(id, reason);
                }
                Step::Closed
            }
        }
    }

    fn discard(&self, id: ConnectionId) {
        if let Some((_, queue)) = self.shared.queues.remove(&id) {
            let count = queue.len();
            self.release(count);
            self.shared
                .stats
                .retry_dropped
                .fetch_add(count as u64, Ordering::Relaxed);
            DeliveryMetrics::record_outcome("retry_dropped", count as u64);
        }
    }

    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let parked = self.shared.parked.fetch_sub(count, Ordering::Relaxed) - count;
        DeliveryMetrics::set_retry_backlog(parked);
    }
}
