//! Graceful shutdown handling for the gateway.
//!
//! This module provides coordinated shutdown functionality that:
//! 1. Stops admitting new connections and resumes
//! 2. Signals background tasks (maintenance sweep, Redis trigger)
//! 3. Closes every connection with `CloseReason::Shutdown`
//! 4. Waits for the live set to drain, bounded by a timeout

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection::CloseReason;
use crate::supervisor::Supervisor;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for the live set to empty (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Time adapters get to write their close frames (default: 500 ms)
    pub close_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            close_grace: Duration::from_millis(500),
        }
    }
}

/// Handles graceful shutdown of the gateway
pub struct GracefulShutdown {
    supervisor: Arc<Supervisor>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(supervisor: Arc<Supervisor>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(supervisor, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        supervisor: Arc<Supervisor>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            supervisor,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.supervisor.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Refusing new connections");
        self.supervisor.begin_shutdown();

        tracing::info!("Phase 2: Signaling background tasks to stop");
        // No receivers just means no background task is running
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 3: Closing connections");
        result.connections_closed = self.supervisor.close_all(CloseReason::Shutdown);

        tracing::info!("Phase 4: Waiting for the live set to drain");
        result.drained = self.wait_for_drain().await;

        if result.connections_closed > 0 && !self.config.close_grace.is_zero() {
            tokio::time::sleep(self.config.close_grace).await;
        }

        result.duration = start.elapsed();
        result.success = result.drained;

        tracing::info!(
            connections_closed = result.connections_closed,
            drained = result.drained,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn wait_for_drain(&self) -> bool {
        if self.supervisor.is_empty() {
            return true;
        }

        let supervisor = self.supervisor.clone();
        let drain_future = async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                // Stragglers admitted before the gate closed
                supervisor.close_all(CloseReason::Shutdown);
                if supervisor.is_empty() {
                    break;
                }
            }
        };

        match timeout(self.config.drain_timeout, drain_future).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining_connections = self.supervisor.len(),
                    "Drain timeout, some connections did not close"
                );
                false
            }
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether the live set drained before the timeout
    pub success: bool,
    /// Connections closed by the shutdown
    pub connections_closed: usize,
    pub drained: bool,
    /// Total time taken for shutdown
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::connection::{Capabilities, ConnectionState, TransportKind};
    use crate::registry::SubscriptionRegistry;

    fn supervisor() -> Arc<Supervisor> {
        let registry = Arc::new(SubscriptionRegistry::default());
        Arc::new(Supervisor::new(GatewayConfig::default(), registry))
    }

    fn quick() -> ShutdownConfig {
        ShutdownConfig {
            drain_timeout: Duration::from_secs(1),
            close_grace: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::with_config(supervisor(), tx, quick());

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.connections_closed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_signals_tasks() {
        let supervisor = supervisor();
        let (conn, _token) = supervisor
            .accept(TransportKind::WebSocket, Capabilities::ReliableOnly)
            .unwrap();
        supervisor.open(conn.id()).unwrap();
        let mut lease = conn.lease_reliable().unwrap();

        let (tx, mut background) = broadcast::channel(1);
        let shutdown = GracefulShutdown::with_config(supervisor.clone(), tx, quick());
        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.connections_closed, 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::Shutdown));
        assert!(lease.recv().await.is_none());
        assert!(background.try_recv().is_ok());

        // The gate stays closed
        assert!(supervisor
            .accept(TransportKind::Sse, Capabilities::ReliableOnly)
            .is_err());
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.close_grace, Duration::from_millis(500));
    }
}
