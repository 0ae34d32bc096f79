//! Per-transport connection table and statistics.
//!
//! Every transport keeps one [`ConnectionRegistry`]. A connection is an
//! outbound queue drained by the transport's writer task plus a stats
//! record. The registry turns opens, closes and inbound frames into
//! [`TransportEvent`]s on the sink handed over by `start`.
//!
//! # Connection Lifecycle
//!
//! 1. `open` - Register a connection and get its outbound receiver
//! 2. `received` - Record an inbound frame and forward it to the sink
//! 3. `send_to` / `broadcast` - Queue outbound text
//! 4. `close` - Forget the connection; its writer sees the queue close

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

use super::base::{EventSink, TransportEvent, TransportKind, TransportStats};

// ============================================================================
// Outbound
// ============================================================================

/// Item queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One serialized envelope.
    Text(String),
    /// Close the connection with a reason code.
    Close {
        /// Close code (WebSocket semantics).
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

// ============================================================================
// ConnectionStats
// ============================================================================

/// Traffic counters of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Connection id.
    pub id: ConnectionId,
    /// Messages queued for sending.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Bytes queued for sending.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Send or protocol failures.
    pub errors: u64,
    /// When the connection opened.
    pub connected_at: DateTime<Utc>,
    /// Last send or receive.
    pub last_activity: DateTime<Utc>,
}

impl ConnectionStats {
    fn new(id: ConnectionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            errors: 0,
            connected_at: now,
            last_activity: now,
        }
    }
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<Outbound>,
    stats: ConnectionStats,
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Live connections of one transport.
///
/// Totals survive connection close so transport stats stay monotonic.
pub struct ConnectionRegistry {
    transport: String,
    kind: TransportKind,
    connections: RwLock<FxHashMap<ConnectionId, ConnectionEntry>>,
    sink: Mutex<Option<EventSink>>,
    running: AtomicBool,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("transport", &self.transport)
            .field("connections", &self.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry for the named transport.
    #[must_use]
    pub fn new(transport: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            transport: transport.into(),
            kind,
            connections: RwLock::new(FxHashMap::default()),
            sink: Mutex::new(None),
            running: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Transport name.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Marks the transport running and starts forwarding events to `sink`.
    pub fn attach(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
        self.running.store(true, Ordering::SeqCst);
    }

    /// Marks the transport stopped, closes every connection and drops the
    /// sink.
    pub fn detach(&self, reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        self.close_all(1001, reason);
        *self.sink.lock() = None;
    }

    /// Returns `true` between `attach` and `detach`.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns `true` while running with at least one live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_running() && !self.connections.read().is_empty()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().as_ref()
            && sink.send(event).is_err()
        {
            trace!(transport = %self.transport, "Event sink closed");
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Registers a new connection.
    ///
    /// Returns its id and the receiver its writer task drains.
    pub fn open(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        let first = {
            let mut connections = self.connections.write();
            connections.insert(
                id,
                ConnectionEntry {
                    tx,
                    stats: ConnectionStats::new(id),
                },
            );
            connections.len() == 1
        };

        debug!(transport = %self.transport, connection = %id, "Connection opened");
        self.emit(TransportEvent::Connected {
            transport: self.transport.clone(),
            connection: id,
        });
        if first {
            self.emit(TransportEvent::StateChanged {
                transport: self.transport.clone(),
                connected: true,
            });
        }

        (id, rx)
    }

    /// Forgets a connection. Returns `false` if it was not registered.
    pub fn close(&self, id: ConnectionId, reason: &str) -> bool {
        let (removed, last) = {
            let mut connections = self.connections.write();
            let removed = connections.remove(&id).is_some();
            (removed, removed && connections.is_empty())
        };
        if !removed {
            return false;
        }

        debug!(transport = %self.transport, connection = %id, reason, "Connection closed");
        self.emit(TransportEvent::Disconnected {
            transport: self.transport.clone(),
            connection: id,
            reason: reason.to_string(),
        });
        if last {
            self.emit(TransportEvent::StateChanged {
                transport: self.transport.clone(),
                connected: false,
            });
        }
        true
    }

    /// Asks every connection's writer to close, then forgets them all.
    pub fn close_all(&self, code: u16, reason: &str) {
        let ids: Vec<ConnectionId> = {
            let connections = self.connections.read();
            for entry in connections.values() {
                let _ = entry.tx.send(Outbound::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
            connections.keys().copied().collect()
        };
        for id in ids {
            self.close(id, reason);
        }
    }

    // ========================================================================
    // Traffic
    // ========================================================================

    /// Records an inbound frame and forwards it to the sink.
    ///
    /// `reply` is set by request/response transports that answer on the
    /// same exchange instead of the connection's outbound queue.
    pub fn received(
        &self,
        id: ConnectionId,
        payload: String,
        reply: Option<oneshot::Sender<String>>,
    ) {
        let bytes = payload.len() as u64;
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        if let Some(entry) = self.connections.write().get_mut(&id) {
            entry.stats.messages_received += 1;
            entry.stats.bytes_received += bytes;
            entry.stats.last_activity = Utc::now();
        }

        trace!(transport = %self.transport, connection = %id, bytes, "Frame received");
        self.emit(TransportEvent::Message {
            transport: self.transport.clone(),
            connection: id,
            payload,
            reply,
        });
    }

    /// Counts a failure against a connection.
    pub fn record_error(&self, id: ConnectionId) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.connections.write().get_mut(&id) {
            entry.stats.errors += 1;
        }
    }

    /// Queues text for one connection.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionNotFound`] if the connection is unknown
    /// - [`Error::ConnectionClosed`] if its writer is gone
    pub fn send_to(&self, id: ConnectionId, text: &str) -> Result<()> {
        let mut connections = self.connections.write();
        let entry = connections
            .get_mut(&id)
            .ok_or(Error::ConnectionNotFound { connection_id: id })?;

        if entry.tx.send(Outbound::Text(text.to_string())).is_err() {
            entry.stats.errors += 1;
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(transport = %self.transport, connection = %id, "Writer gone");
            return Err(Error::ConnectionClosed);
        }

        let bytes = text.len() as u64;
        entry.stats.messages_sent += 1;
        entry.stats.bytes_sent += bytes;
        entry.stats.last_activity = Utc::now();
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Queues text for every connection. Returns how many accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] if no connection is open.
    pub fn broadcast(&self, text: &str) -> Result<usize> {
        let ids = self.ids();
        if ids.is_empty() {
            return Err(Error::transport_unavailable(format!(
                "{} has no open connections",
                self.transport
            )));
        }
        Ok(ids.into_iter().filter(|id| self.send_to(*id, text).is_ok()).count())
    }

    /// Closes one connection with a code, letting its writer send the frame.
    pub fn reject(&self, id: ConnectionId, code: u16, reason: &str) {
        if let Some(entry) = self.connections.read().get(&id) {
            let _ = entry.tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.record_error(id);
        self.close(id, reason);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns `true` if no connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `id` is live.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Ids of live connections.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }

    /// Stats of one connection.
    #[must_use]
    pub fn connection_stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        self.connections.read().get(&id).map(|e| e.stats.clone())
    }

    /// Aggregated transport stats.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        let mut connections: Vec<ConnectionStats> = self
            .connections
            .read()
            .values()
            .map(|e| e.stats.clone())
            .collect();
        connections.sort_by_key(|c| c.connected_at);

        TransportStats {
            name: self.transport.clone(),
            kind: self.kind,
            running: self.is_running(),
            connected: self.is_connected(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connections,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
