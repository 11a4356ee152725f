use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use folio_core::types::{CallerId, Timestamp};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Metadata for a single session.
pub struct WsConnection {
    /// Authenticated caller that opened the session.
    pub caller_id: CallerId,
    /// Channel sender for outbound messages to this connection.
    pub sender: WsSender,
    /// When this connection was established.
    pub connected_at: Timestamp,
    /// Cancelled when the server ends the session; in-flight calls watch it.
    pub cancel: CancellationToken,
    /// Milliseconds since the manager epoch of the last inbound frame.
    last_seen_ms: AtomicU64,
    /// Milliseconds since the manager epoch of the last submitted call.
    last_call_ms: AtomicU64,
}

/// Handles returned to the session task on registration.
pub struct SessionChannel {
    pub rx: mpsc::UnboundedReceiver<Message>,
    pub sender: WsSender,
    pub cancel: CancellationToken,
}

/// Why the heartbeat closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Nothing received, not even a pong.
    Silent,
    /// Pongs only, no calls.
    Inactive,
}

/// Manages all active session connections.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application. Activity timestamps are atomics so that
/// recording them only needs the read lock.
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
    epoch: Instant,
}

impl WsManager {
    /// Create a new, empty connection manager.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    /// Register a new connection.
    pub async fn add(&self, conn_id: String, caller_id: CallerId) -> SessionChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let now = self.now_ms();
        let conn = WsConnection {
            caller_id,
            sender: tx.clone(),
            connected_at: chrono::Utc::now(),
            cancel: cancel.clone(),
            last_seen_ms: AtomicU64::new(now),
            last_call_ms: AtomicU64::new(now),
        };
        self.connections.write().await.insert(conn_id, conn);
        SessionChannel {
            rx,
            sender: tx,
            cancel,
        }
    }

    /// Remove a connection by its ID.
    pub async fn remove(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    /// Record an inbound frame of any kind.
    pub async fn touch(&self, conn_id: &str) {
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            conn.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Record a submitted call. Also counts as an inbound frame.
    pub async fn record_call(&self, conn_id: &str) {
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            let now = self.now_ms();
            conn.last_seen_ms.store(now, Ordering::Relaxed);
            conn.last_call_ms.store(now, Ordering::Relaxed);
        }
    }

    /// Return the current number of active connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// End every session, then clear the map.
    ///
    /// Each session task notices the cancellation, fails its in-flight calls
    /// and sends the Close frame itself.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            conn.cancel.cancel();
        }
        conns.clear();
        tracing::info!(count, "Closed all sessions");
    }

    /// Send a Ping frame to every connected client.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }

    /// End sessions silent for longer than `silence_timeout` or without a
    /// call for longer than `max_inactivity`. Returns the closed IDs.
    pub async fn close_stale(
        &self,
        silence_timeout: Duration,
        max_inactivity: Duration,
    ) -> Vec<(String, StaleReason)> {
        let now = self.now_ms();
        let silence_ms = silence_timeout.as_millis() as u64;
        let inactivity_ms = max_inactivity.as_millis() as u64;

        let mut conns = self.connections.write().await;
        let stale: Vec<(String, StaleReason)> = conns
            .iter()
            .filter_map(|(id, conn)| {
                let seen = conn.last_seen_ms.load(Ordering::Relaxed);
                let called = conn.last_call_ms.load(Ordering::Relaxed);
                if now.saturating_sub(seen) > silence_ms {
                    Some((id.clone(), StaleReason::Silent))
                } else if now.saturating_sub(called) > inactivity_ms {
                    Some((id.clone(), StaleReason::Inactive))
                } else {
                    None
                }
            })
            .collect();

        for (id, reason) in &stale {
            if let Some(conn) = conns.remove(id) {
                conn.cancel.cancel();
                tracing::info!(conn_id = %id, caller_id = conn.caller_id, ?reason, "Closing stale session");
            }
        }
        stale
    }

    fn now_ms(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
