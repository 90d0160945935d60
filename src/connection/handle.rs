//! Connection handle shared between the supervisor, the dispatcher and the
//! adapter currently serving the client.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::event::{DeliveryMode, Event};

use super::state::{ConnectionState, StateCell};
use super::types::{
    route, Capabilities, CloseReason, ConnectionId, Lane, SendError, SendOutcome, TransportKind,
};

/// Outbound queue sizes for one connection
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub reliable: usize,
    pub datagram: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            reliable: 64,
            datagram: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseLane {
    Reliable,
    Datagram,
}

type Slot = Mutex<Option<mpsc::Receiver<Arc<Event>>>>;

/// Handle for a single client connection of any transport kind
pub struct Connection {
    id: ConnectionId,
    kind: TransportKind,
    capabilities: Capabilities,
    state: StateCell,
    connected_at: DateTime<Utc>,
    /// Unix millis - using AtomicI64 for lock-free updates
    last_activity: AtomicI64,
    /// Unix millis of the OPEN -> RECONNECTING move, 0 when not suspended
    suspended_at: AtomicI64,
    reliable_tx: mpsc::Sender<Arc<Event>>,
    datagram_tx: Option<mpsc::Sender<Arc<Event>>>,
    reliable_rx: Slot,
    datagram_rx: Slot,
    /// Largest body the datagram lane accepts
    datagram_budget: AtomicUsize,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(kind: TransportKind, capabilities: Capabilities, limits: QueueLimits) -> Arc<Self> {
        let (reliable_tx, reliable_rx) = mpsc::channel(limits.reliable.max(1));
        let (datagram_tx, datagram_rx) = if capabilities.supports_datagrams() {
            let (tx, rx) = mpsc::channel(limits.datagram.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let now = Utc::now();
        Arc::new(Self {
            id: ConnectionId::new(),
            kind,
            capabilities,
            state: StateCell::new(),
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            suspended_at: AtomicI64::new(0),
            reliable_tx,
            datagram_tx,
            reliable_rx: Mutex::new(Some(reliable_rx)),
            datagram_rx: Mutex::new(datagram_rx),
            datagram_budget: AtomicUsize::new(usize::MAX),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// The single entry point for state changes.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState, GatewayError> {
        if to == ConnectionState::Reconnecting && !self.kind.supports_resume() {
            return Err(GatewayError::InvalidTransition {
                from: self.state(),
                to,
            });
        }

        let from = self.state.transition(to)?;
        match to {
            ConnectionState::Reconnecting => {
                self.suspended_at
                    .store(Utc::now().timestamp_millis(), Ordering::Release);
            }
            ConnectionState::Open => {
                self.suspended_at.store(0, Ordering::Release);
                self.touch();
            }
            _ => {}
        }

        tracing::debug!(
            connection_id = %self.id,
            transport = %self.kind,
            from = %from,
            to = %to,
            "Connection state transition"
        );
        Ok(from)
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub fn suspended_since(&self) -> Option<DateTime<Utc>> {
        match self.suspended_at.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Set by the adapter once the session has negotiated its datagram size
    pub fn set_datagram_budget(&self, bytes: usize) {
        self.datagram_budget.store(bytes, Ordering::Relaxed);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Events waiting in the reliable queue
    pub fn pending(&self) -> usize {
        self.reliable_tx.max_capacity() - self.reliable_tx.capacity()
    }

    /// Offer an event to this connection without ever waiting.
    ///
    /// Reliable events that do not fit return `Backpressure`; nothing already
    /// queued is evicted. Best-effort events that do not fit are `Dropped`.
    pub fn send(&self, event: &Arc<Event>) -> Result<SendOutcome, SendError> {
        let lane = route(self.kind, self.capabilities, event.mode);

        match self.state() {
            ConnectionState::Open => {}
            // Reliable events wait for the client in the queue; anything
            // lossy is pointless while no transport is attached.
            ConnectionState::Reconnecting => {
                if lane != Lane::Reliable || event.mode == DeliveryMode::BestEffort {
                    return Ok(SendOutcome::Dropped);
                }
            }
            _ => return Err(SendError::Closed),
        }

        let outcome = match lane {
            Lane::Reliable => match self.reliable_tx.try_send(event.clone()) {
                Ok(()) => SendOutcome::Ack,
                Err(TrySendError::Full(_)) => return Err(SendError::Backpressure),
                Err(TrySendError::Closed(_)) => return Err(SendError::Closed),
            },
            Lane::ReliableTry => match self.reliable_tx.try_send(event.clone()) {
                Ok(()) => SendOutcome::Ack,
                Err(TrySendError::Full(_)) => SendOutcome::Dropped,
                Err(TrySendError::Closed(_)) => return Err(SendError::Closed),
            },
            Lane::Datagram if event.body.len() > self.datagram_budget.load(Ordering::Relaxed) => {
                SendOutcome::Dropped
            }
            Lane::Datagram => match &self.datagram_tx {
                Some(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => SendOutcome::Ack,
                    Err(TrySendError::Full(_)) => SendOutcome::Dropped,
                    Err(TrySendError::Closed(_)) => return Err(SendError::Closed),
                },
                None => SendOutcome::Dropped,
            },
        };

        if outcome == SendOutcome::Ack {
            self.touch();
        }
        Ok(outcome)
    }

    /// Move to CLOSING and discard everything still queued. Returns false if
    /// the connection was already closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.transition(ConnectionState::Closing).is_err() {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.cancel.cancel();

        let discarded = self.discard_pending();
        self.datagram_rx.lock().take();

        tracing::debug!(
            connection_id = %self.id,
            reason = %reason,
            discarded = discarded,
            "Connection closing"
        );
        true
    }

    /// Drop every queued reliable event, returning how many were discarded.
    /// Only reaches the queue while no adapter holds the lease.
    pub fn discard_pending(&self) -> usize {
        let mut slot = self.reliable_rx.lock();
        let mut discarded = 0;
        if let Some(rx) = slot.as_mut() {
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
        }
        if self.state().is_closing() {
            slot.take();
        }
        discarded
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Take the reliable queue's receiving end. `None` if another adapter
    /// already holds it or the connection is closing.
    pub fn lease_reliable(self: &Arc<Self>) -> Option<LeasedReceiver> {
        self.lease(LeaseLane::Reliable)
    }

    /// Take the datagram queue's receiving end, if the connection has one.
    pub fn lease_datagrams(self: &Arc<Self>) -> Option<LeasedReceiver> {
        self.lease(LeaseLane::Datagram)
    }

    fn lease(self: &Arc<Self>, lane: LeaseLane) -> Option<LeasedReceiver> {
        if self.state().is_closing() {
            return None;
        }
        let rx = self.slot(lane).lock().take()?;
        Some(LeasedReceiver {
            connection: self.clone(),
            lane,
            rx: Some(rx),
        })
    }

    fn slot(&self, lane: LeaseLane) -> &Slot {
        match lane {
            LeaseLane::Reliable => &self.reliable_rx,
            LeaseLane::Datagram => &self.datagram_rx,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            transport: self.kind,
            capabilities: self.capabilities,
            state: self.state(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            pending: self.pending(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Receiving end of an outbound queue, on loan to an adapter.
///
/// Dropping the lease hands the receiver back to the connection, so a
/// resumed client picks up whatever is still queued. Once the connection is
/// closing the receiver is dropped instead.
pub struct LeasedReceiver {
    connection: Arc<Connection>,
    lane: LeaseLane,
    rx: Option<mpsc::Receiver<Arc<Event>>>,
}

impl LeasedReceiver {
    /// Next queued event, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        let Self { connection, rx, .. } = self;
        let rx = rx.as_mut()?;
        tokio::select! {
            biased;
            _ = connection.cancel.cancelled() => None,
            event = rx.recv() => event,
        }
    }

    /// Non-blocking variant of `recv`
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        if self.connection.is_cancelled() {
            return None;
        }
        self.rx.as_mut()?.try_recv().ok()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Drop for LeasedReceiver {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            // `close` moves to CLOSING before it empties the slots, so the
            // check has to happen under the slot lock
            let mut slot = self.connection.slot(self.lane).lock();
            if self.connection.state().is_closing() {
                return;
            }
            *slot = Some(rx);
        }
    }
}

/// Serializable connection snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub capabilities: Capabilities,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;

    fn event(seq: u64, mode: DeliveryMode) -> Arc<Event> {
        Arc::new(EventDraft::new("t", format!("{{\"n\":{}}}", seq), mode).stamp(seq))
    }

    fn open(kind: TransportKind, caps: Capabilities, limits: QueueLimits) -> Arc<Connection> {
        let conn = Connection::new(kind, caps, limits);
        conn.transition(ConnectionState::Open).unwrap();
        conn
    }

    #[test]
    fn test_send_before_open_is_closed() {
        let conn = Connection::new(TransportKind::Sse, Capabilities::ReliableOnly, QueueLimits::default());
        assert_eq!(conn.send(&event(1, DeliveryMode::Reliable)), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_full_queue_is_backpressure_not_eviction() {
        let limits = QueueLimits { reliable: 10, datagram: 10 };
        let conn = open(TransportKind::WebSocket, Capabilities::ReliableOnly, limits);

        for seq in 1..=10 {
            assert_eq!(conn.send(&event(seq, DeliveryMode::Reliable)), Ok(SendOutcome::Ack));
        }
        assert_eq!(
            conn.send(&event(11, DeliveryMode::Reliable)),
            Err(SendError::Backpressure)
        );
        assert_eq!(conn.pending(), 10);

        let mut lease = conn.lease_reliable().unwrap();
        assert_eq!(lease.recv().await.unwrap().seq, 1);
    }

    #[test]
    fn test_best_effort_dropped_when_saturated() {
        let limits = QueueLimits { reliable: 1, datagram: 1 };
        let conn = open(TransportKind::WebSocket, Capabilities::ReliableOnly, limits);
        assert_eq!(conn.send(&event(1, DeliveryMode::BestEffort)), Ok(SendOutcome::Ack));
        assert_eq!(conn.send(&event(2, DeliveryMode::BestEffort)), Ok(SendOutcome::Dropped));
    }

    #[test]
    fn test_sse_downgrades_best_effort() {
        let limits = QueueLimits { reliable: 1, datagram: 1 };
        let conn = open(TransportKind::Sse, Capabilities::ReliableOnly, limits);
        assert_eq!(conn.send(&event(1, DeliveryMode::BestEffort)), Ok(SendOutcome::Ack));
        // Downgraded to reliable, so a full queue is backpressure
        assert_eq!(
            conn.send(&event(2, DeliveryMode::BestEffort)),
            Err(SendError::Backpressure)
        );
    }

    #[tokio::test]
    async fn test_webtransport_best_effort_uses_datagram_lane() {
        let conn = open(
            TransportKind::WebTransport,
            Capabilities::ReliableAndDatagram,
            QueueLimits::default(),
        );
        conn.send(&event(1, DeliveryMode::BestEffort)).unwrap();
        assert_eq!(conn.pending(), 0);

        let mut datagrams = conn.lease_datagrams().unwrap();
        assert_eq!(datagrams.recv().await.unwrap().seq, 1);
    }

    #[test]
    fn test_oversized_datagram_dropped() {
        let conn = open(
            TransportKind::WebTransport,
            Capabilities::ReliableAndDatagram,
            QueueLimits::default(),
        );
        conn.set_datagram_budget(8);
        assert_eq!(conn.send(&event(1, DeliveryMode::BestEffort)), Ok(SendOutcome::Ack));
        assert_eq!(
            conn.send(&event(1_000_000_000, DeliveryMode::BestEffort)),
            Ok(SendOutcome::Dropped)
        );
        // Reliable events never touch the datagram budget
        assert_eq!(
            conn.send(&event(1_000_000_000, DeliveryMode::Reliable)),
            Ok(SendOutcome::Ack)
        );
    }

    #[tokio::test]
    async fn test_close_discards_queue() {
        let conn = open(TransportKind::WebSocket, Capabilities::ReliableOnly, QueueLimits::default());
        conn.send(&event(1, DeliveryMode::Reliable)).unwrap();
        conn.send(&event(2, DeliveryMode::Reliable)).unwrap();

        assert!(conn.close(CloseReason::ClientDisconnect));
        assert!(!conn.close(CloseReason::ClientDisconnect));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.close_reason(), Some(CloseReason::ClientDisconnect));
        assert_eq!(conn.send(&event(3, DeliveryMode::Reliable)), Err(SendError::Closed));
        assert!(conn.lease_reliable().is_none());
    }

    #[tokio::test]
    async fn test_leased_receiver_stops_on_close() {
        let conn = open(TransportKind::WebSocket, Capabilities::ReliableOnly, QueueLimits::default());
        conn.send(&event(1, DeliveryMode::Reliable)).unwrap();
        let mut lease = conn.lease_reliable().unwrap();
        conn.close(CloseReason::Shutdown);
        assert!(lease.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lease_is_returned_on_drop() {
        let conn = open(TransportKind::Sse, Capabilities::ReliableOnly, QueueLimits::default());
        conn.send(&event(1, DeliveryMode::Reliable)).unwrap();

        let lease = conn.lease_reliable().unwrap();
        assert!(conn.lease_reliable().is_none());
        drop(lease);

        let mut lease = conn.lease_reliable().unwrap();
        assert_eq!(lease.recv().await.unwrap().seq, 1);
    }

    #[test]
    fn test_lease_dropped_during_close_is_not_reattached() {
        for _ in 0..200 {
            let conn = open(
                TransportKind::WebTransport,
                Capabilities::ReliableAndDatagram,
                QueueLimits::default(),
            );
            conn.send(&event(1, DeliveryMode::Reliable)).unwrap();
            let reliable = conn.lease_reliable().unwrap();
            let datagrams = conn.lease_datagrams().unwrap();

            let closer = {
                let conn = conn.clone();
                std::thread::spawn(move || conn.close(CloseReason::Shutdown))
            };
            drop(reliable);
            drop(datagrams);
            assert!(closer.join().unwrap());

            assert!(conn.reliable_rx.lock().is_none());
            assert!(conn.datagram_rx.lock().is_none());
        }
    }

    #[test]
    fn test_reconnecting_queues_reliable_drops_best_effort() {
        let conn = open(
            TransportKind::WebTransport,
            Capabilities::ReliableAndDatagram,
            QueueLimits::default(),
        );
        conn.transition(ConnectionState::Reconnecting).unwrap();
        assert!(conn.suspended_since().is_some());

        assert_eq!(conn.send(&event(1, DeliveryMode::Reliable)), Ok(SendOutcome::Ack));
        assert_eq!(conn.send(&event(2, DeliveryMode::BestEffort)), Ok(SendOutcome::Dropped));
        assert_eq!(conn.pending(), 1);

        conn.transition(ConnectionState::Open).unwrap();
        assert!(conn.suspended_since().is_none());
    }

    #[test]
    fn test_websocket_cannot_reconnect() {
        let conn = open(TransportKind::WebSocket, Capabilities::ReliableOnly, QueueLimits::default());
        assert!(conn.transition(ConnectionState::Reconnecting).is_err());
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_discard_pending() {
        let conn = open(TransportKind::Sse, Capabilities::ReliableOnly, QueueLimits::default());
        for seq in 1..=3 {
            conn.send(&event(seq, DeliveryMode::Reliable)).unwrap();
        }
        assert_eq!(conn.discard_pending(), 3);
        assert_eq!(conn.pending(), 0);
        // Still usable after discarding
        assert!(conn.lease_reliable().is_some());
    }
}
