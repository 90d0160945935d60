use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::api::update_gauges;
use crate::server::AppState;
use crate::supervisor::SweepReport;

/// Background task for the idle and reconnect-window sweeps
pub struct MaintenanceTask {
    state: AppState,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl MaintenanceTask {
    pub fn new(state: AppState, shutdown: broadcast::Receiver<()>) -> Self {
        let interval = state.settings.gateway.sweep_interval();
        Self {
            state,
            interval,
            shutdown,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            sweep_interval_ms = self.interval.as_millis() as u64,
            "Maintenance task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Maintenance task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.run_once();
                }
            }
        }

        tracing::info!("Maintenance task stopped");
    }

    /// One sweep plus a gauge refresh
    pub fn run_once(&self) -> SweepReport {
        self.run_once_at(Utc::now())
    }

    fn run_once_at(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.state.supervisor.sweep_at(now);
        update_gauges(&self.state);
        tracing::debug!(
            closed = report.closed(),
            reconnecting = report.reconnecting,
            connections = self.state.supervisor.len(),
            "Maintenance sweep completed"
        );
        report
    }
}
