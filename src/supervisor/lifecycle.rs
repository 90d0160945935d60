use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::config::{GatewayConfig, ReplayPolicy};
use crate::connection::{
    Capabilities, CloseReason, Connection, ConnectionId, ConnectionState, QueueLimits,
    TransportKind,
};
use crate::error::GatewayError;
use crate::metrics::{ConnectionMetrics, HeartbeatMetrics};
use crate::registry::SubscriptionRegistry;

use super::stats::{SupervisorStats, SweepReport};
use super::token::ContinuationToken;

/// A connection picked up again through its continuation token
#[derive(Debug)]
pub struct Resumed {
    pub connection: Arc<Connection>,
    /// Replaces the token that was presented
    pub token: ContinuationToken,
    /// Whether events queued while suspended will be delivered
    pub replayed: bool,
    /// Events thrown away because replay is disabled
    pub discarded: usize,
}

/// Owns every live connection and drives its lifecycle.
///
/// The registry and dispatcher only ever hold `ConnectionId`s and look the
/// connection up here on each use.
pub struct Supervisor {
    config: GatewayConfig,
    registry: Arc<SubscriptionRegistry>,
    /// connection_id -> Connection (the live set)
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// token -> connection_id
    tokens: DashMap<ContinuationToken, ConnectionId>,
    /// connection_id -> its current token
    issued: DashMap<ConnectionId, ContinuationToken>,
    shutting_down: AtomicBool,
    accepted_total: AtomicU64,
    resumed_total: AtomicU64,
    closed_total: AtomicU64,
}

impl Supervisor {
    pub fn new(config: GatewayConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            config,
            registry,
            connections: DashMap::new(),
            tokens: DashMap::new(),
            issued: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            accepted_total: AtomicU64::new(0),
            resumed_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Admit a new connection in CONNECTING and attach it to the registry.
    pub fn accept(
        &self,
        kind: TransportKind,
        capabilities: Capabilities,
    ) -> Result<(Arc<Connection>, ContinuationToken), GatewayError> {
        if self.is_shutting_down() {
            ConnectionMetrics::record_handshake_failed(kind);
            return Err(GatewayError::HandshakeFailed("server shutting down".into()));
        }
        if self.connections.len() >= self.config.max_connections {
            ConnectionMetrics::record_handshake_failed(kind);
            tracing::warn!(
                transport = %kind,
                max = self.config.max_connections,
                "Connection limit reached, rejecting"
            );
            return Err(GatewayError::HandshakeFailed(
                "connection limit reached".into(),
            ));
        }

        let limits = QueueLimits {
            reliable: self.config.outbound_queue_capacity,
            datagram: self.config.datagram_queue_capacity,
        };
        let connection = Connection::new(kind, capabilities, limits);
        let id = connection.id();

        self.registry.attach(id);
        self.connections.insert(id, connection.clone());
        let token = self.issue_token(id);

        self.accepted_total.fetch_add(1, Ordering::Relaxed);
        ConnectionMetrics::record_opened(kind);
        tracing::info!(connection_id = %id, transport = %kind, "Connection accepted");

        Ok((connection, token))
    }

    /// CONNECTING -> OPEN once the adapter's handshake is complete
    pub fn open(&self, id: ConnectionId) -> Result<(), GatewayError> {
        let connection = self.get(id).ok_or(GatewayError::UnknownConnection(id))?;
        connection.transition(ConnectionState::Open)?;
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// The adapter serving `id` went away. Resumable connections enter
    /// RECONNECTING and keep their queue; everything else is torn down.
    /// Returns `true` if the connection was suspended.
    pub fn suspend(&self, id: ConnectionId) -> bool {
        let Some(connection) = self.get(id) else {
            return false;
        };

        if connection.kind().supports_resume() && !self.config.reconnect_grace().is_zero() {
            match connection.transition(ConnectionState::Reconnecting) {
                Ok(_) => {
                    tracing::info!(
                        connection_id = %id,
                        transport = %connection.kind(),
                        grace_secs = self.config.reconnect_grace,
                        pending = connection.pending(),
                        "Connection suspended, awaiting resume"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::debug!(connection_id = %id, error = %e, "Cannot suspend connection");
                }
            }
        }

        self.teardown(id, CloseReason::ClientDisconnect);
        false
    }

    /// Re-attach a suspended connection using its continuation token.
    pub fn resume(
        &self,
        token: &ContinuationToken,
        kind: TransportKind,
    ) -> Result<Resumed, GatewayError> {
        if self.is_shutting_down() {
            return Err(GatewayError::HandshakeFailed("server shutting down".into()));
        }

        let Some((_, id)) = self.tokens.remove(token) else {
            ConnectionMetrics::record_resume("rejected");
            return Err(GatewayError::HandshakeFailed(
                "unknown continuation token".into(),
            ));
        };

        let Some(connection) = self.get(id) else {
            ConnectionMetrics::record_resume("rejected");
            return Err(GatewayError::HandshakeFailed(
                "unknown continuation token".into(),
            ));
        };

        if connection.kind() != kind || connection.state() != ConnectionState::Reconnecting {
            // Not ours to consume; leave the token valid for the right caller
            self.tokens.insert(*token, id);
            ConnectionMetrics::record_resume("rejected");
            let reason = if connection.kind() != kind {
                "transport mismatch"
            } else {
                "connection is not awaiting resume"
            };
            return Err(GatewayError::HandshakeFailed(reason.into()));
        }

        if self.grace_expired(&connection, Utc::now()) {
            self.teardown(id, CloseReason::ReconnectExpired);
            ConnectionMetrics::record_resume("expired");
            return Err(GatewayError::HandshakeFailed(
                "reconnect window expired".into(),
            ));
        }

        let (replayed, discarded) = match self.config.replay_policy {
            ReplayPolicy::Replay => (true, 0),
            ReplayPolicy::None => (false, connection.discard_pending()),
        };

        if let Err(e) = connection.transition(ConnectionState::Open) {
            // Lost the race against the sweep
            ConnectionMetrics::record_resume("expired");
            return Err(GatewayError::HandshakeFailed(e.to_string()));
        }

        let token = self.issue_token(id);
        self.resumed_total.fetch_add(1, Ordering::Relaxed);
        ConnectionMetrics::record_resume(if replayed { "resumed" } else { "discarded" });
        tracing::info!(
            connection_id = %id,
            transport = %kind,
            replayed = replayed,
            discarded = discarded,
            pending = connection.pending(),
            "Connection resumed"
        );

        Ok(Resumed {
            connection,
            token,
            replayed,
            discarded,
        })
    }

    /// Tear a connection down. Order matters: the registry entry is removed
    /// before the connection leaves the live set, so the dispatcher can never
    /// resolve an ID that no longer has a connection behind it.
    ///
    /// Returns `true` for the call that actually removed the connection.
    pub fn teardown(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let Some(connection) = self.get(id) else {
            return false;
        };

        connection.close(reason);
        self.registry.detach(id);

        if self.connections.remove(&id).is_none() {
            return false;
        }
        if let Some((_, token)) = self.issued.remove(&id) {
            self.tokens.remove(&token);
        }
        let _ = connection.transition(ConnectionState::Closed);

        let reason = connection.close_reason().unwrap_or(reason);
        let duration = (Utc::now() - connection.connected_at())
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        self.closed_total.fetch_add(1, Ordering::Relaxed);
        if reason == CloseReason::HandshakeFailed {
            ConnectionMetrics::record_handshake_failed(connection.kind());
        }
        ConnectionMetrics::record_closed(connection.kind(), reason, duration);
        tracing::info!(
            connection_id = %id,
            transport = %connection.kind(),
            reason = %reason,
            duration_secs = duration,
            "Connection torn down"
        );
        true
    }

    /// Tear down idle connections, expired reconnect windows and handshakes
    /// that never completed.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let start = Instant::now();
        let idle_timeout = chrono::Duration::seconds(self.config.idle_timeout as i64);
        let mut report = SweepReport::default();

        // Collect first; teardown must not run under a live-set guard
        let mut doomed = Vec::new();
        for entry in self.connections.iter() {
            let connection = entry.value();
            match connection.state() {
                ConnectionState::Reconnecting => {
                    if self.grace_expired(connection, now) {
                        doomed.push((connection.id(), CloseReason::ReconnectExpired));
                    } else {
                        report.reconnecting += 1;
                    }
                }
                ConnectionState::Open => {
                    if now.signed_duration_since(connection.last_activity()) > idle_timeout {
                        doomed.push((connection.id(), CloseReason::IdleTimeout));
                    }
                }
                ConnectionState::Connecting => {
                    if now.signed_duration_since(connection.connected_at()) > idle_timeout {
                        doomed.push((connection.id(), CloseReason::HandshakeFailed));
                    }
                }
                ConnectionState::Closing | ConnectionState::Closed => {}
            }
        }

        for (id, reason) in doomed {
            if self.teardown(id, reason) {
                match reason {
                    CloseReason::ReconnectExpired => report.reconnect_expired += 1,
                    CloseReason::IdleTimeout => report.idle_closed += 1,
                    _ => report.handshake_expired += 1,
                }
            }
        }

        ConnectionMetrics::set_reconnecting(report.reconnecting);
        HeartbeatMetrics::record_sweep(start.elapsed().as_millis() as u64);
        if report.closed() > 0 {
            tracing::info!(
                idle = report.idle_closed,
                reconnect_expired = report.reconnect_expired,
                handshake_expired = report.handshake_expired,
                "Sweep closed connections"
            );
        }
        report
    }

    /// Stop admitting new connections and resumes
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Tear down every live connection, returning how many were closed
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.connection_ids()
            .into_iter()
            .filter(|id| self.teardown(*id, reason))
            .count()
    }

    pub fn stats(&self) -> SupervisorStats {
        let mut by_transport: HashMap<String, usize> = TransportKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), 0))
            .collect();
        let mut by_state = HashMap::new();

        for entry in self.connections.iter() {
            let connection = entry.value();
            *by_transport
                .entry(connection.kind().as_str().to_string())
                .or_default() += 1;
            *by_state
                .entry(connection.state().as_str().to_string())
                .or_default() += 1;
        }

        SupervisorStats {
            total_connections: self.connections.len(),
            by_transport,
            by_state,
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            resumed_total: self.resumed_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
        }
    }

    fn issue_token(&self, id: ConnectionId) -> ContinuationToken {
        let token = ContinuationToken::generate();
        if let Some(previous) = self.issued.insert(id, token) {
            self.tokens.remove(&previous);
        }
        self.tokens.insert(token, id);
        token
    }

    fn grace_expired(&self, connection: &Connection, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::seconds(self.config.reconnect_grace as i64);
        connection
            .suspended_since()
            .map(|since| now.signed_duration_since(since) > grace)
            .unwrap_or(false)
    }
}
