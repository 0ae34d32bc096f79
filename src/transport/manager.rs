//! Multi-transport routing with failover and replay.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               TransportManager               │
//! │  primary ──► "ws"                            │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐      │
//! │  │    ws    │ │   sse    │ │   pipe   │      │
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘      │
//! │       └── events ──┴────────────┘            │
//! │             │  (failover on StateChanged)    │
//! │             ▼                                │
//! │        owner receiver                        │
//! │  replay ring: last N outbound messages       │
//! └──────────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

use super::base::{EventSink, Transport, TransportEvent, TransportStats};

// ============================================================================
// Types
// ============================================================================

/// One recorded outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Serialized envelope.
    pub message: String,
    /// When it was sent.
    pub sent_at: DateTime<Utc>,
}

/// Fixed-size ring of recent outbound messages.
#[derive(Debug)]
struct ReplayBuffer {
    capacity: usize,
    next_seq: u64,
    entries: VecDeque<ReplayEntry>,
}

impl ReplayBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, message: &str) -> u64 {
        self.next_seq += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ReplayEntry {
            seq: self.next_seq,
            message: message.to_string(),
            sent_at: Utc::now(),
        });
        self.next_seq
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    /// Transports that accepted the message.
    pub delivered: Vec<String>,
    /// Transports that failed, with the error text.
    pub failed: Vec<(String, String)>,
}

/// Manager-level snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportManagerStats {
    /// Current primary transport.
    pub primary: Option<String>,
    /// Messages held in the replay ring.
    pub replay_buffered: usize,
    /// Per-transport stats in registration order.
    pub transports: Vec<TransportStats>,
}

// ============================================================================
// TransportManager
// ============================================================================

struct ManagerInner {
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    primary: RwLock<Option<String>>,
    replay: Mutex<ReplayBuffer>,
    sink: Mutex<Option<EventSink>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every registered transport behind one send/broadcast API.
///
/// Cheap to clone; clones share the same transports.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("transports", &self.names())
            .field("primary", &self.primary())
            .finish_non_exhaustive()
    }
}

impl TransportManager {
    /// Creates a manager keeping the last `replay_capacity` messages.
    #[must_use]
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transports: RwLock::new(Vec::new()),
                primary: RwLock::new(None),
                replay: Mutex::new(ReplayBuffer::new(replay_capacity.max(1))),
                sink: Mutex::new(None),
                forwarder: Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// TransportManager - Registration
// ============================================================================

impl TransportManager {
    /// Registers a transport.
    ///
    /// The first registered transport becomes primary unless a later one is
    /// registered with `primary` set. When the manager is already running,
    /// the transport is started immediately.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateTransport`] if the name is taken
    /// - Any error from starting the transport
    pub async fn register(&self, transport: Arc<dyn Transport>, primary: bool) -> Result<()> {
        let name = transport.name().to_string();
        {
            let mut transports = self.inner.transports.write();
            if transports.iter().any(|t| t.name() == name) {
                return Err(Error::DuplicateTransport { name });
            }
            transports.push(Arc::clone(&transport));
        }

        {
            let mut current = self.inner.primary.write();
            if primary || current.is_none() {
                *current = Some(name.clone());
            }
        }

        info!(transport = %name, kind = %transport.kind(), primary, "Transport registered");

        let sink = self.inner.sink.lock().clone();
        if let Some(sink) = sink {
            transport.start(sink).await?;
        }
        Ok(())
    }

    /// Stops and removes a transport, failing over if it was primary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportNotFound`] for an unknown name.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let transport = {
            let mut transports = self.inner.transports.write();
            let index = transports
                .iter()
                .position(|t| t.name() == name)
                .ok_or_else(|| Error::transport_not_found(name))?;
            transports.remove(index)
        };

        if let Err(e) = transport.stop().await {
            warn!(transport = name, error = %e, "Transport stop failed");
        }

        let was_primary = self.inner.primary.read().as_deref() == Some(name);
        if was_primary {
            self.fail_over(name);
        }
        info!(transport = name, "Transport unregistered");
        Ok(())
    }

    /// Current primary transport.
    #[must_use]
    pub fn primary(&self) -> Option<String> {
        self.inner.primary.read().clone()
    }

    /// Registered transport names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner
            .transports
            .read()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Looks up a transport.
    #[must_use]
    pub fn transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.inner
            .transports
            .read()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<dyn Transport>> {
        self.transport(name)
            .ok_or_else(|| Error::transport_not_found(name))
    }
}

// ============================================================================
// TransportManager - Lifecycle
// ============================================================================

impl TransportManager {
    /// Starts every registered transport.
    ///
    /// Returns the receiver on which all transport events arrive. Primary
    /// failover is applied before a `StateChanged` event is forwarded.
    ///
    /// # Errors
    ///
    /// Returns the first transport start failure. Transports started before
    /// it keep running until [`TransportManager::stop`].
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        *self.inner.sink.lock() = Some(internal_tx.clone());

        let manager = self.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                if let TransportEvent::StateChanged {
                    transport,
                    connected,
                } = &event
                {
                    manager.on_state_changed(transport, *connected);
                }
                if out_tx.send(event).is_err() {
                    debug!("Transport event receiver dropped");
                    break;
                }
            }
        });
        *self.inner.forwarder.lock() = Some(forwarder);

        let transports: Vec<Arc<dyn Transport>> = self.inner.transports.read().clone();
        for transport in transports {
            if let Err(e) = transport.start(internal_tx.clone()).await {
                error!(transport = transport.name(), error = %e, "Transport failed to start");
                return Err(e);
            }
        }

        info!(transports = self.names().len(), primary = ?self.primary(), "Transport manager started");
        Ok(out_rx)
    }

    /// Stops every transport and the event forwarder.
    pub async fn stop(&self) {
        let transports: Vec<Arc<dyn Transport>> = self.inner.transports.read().clone();
        for transport in transports {
            if let Err(e) = transport.stop().await {
                warn!(transport = transport.name(), error = %e, "Transport stop failed");
            }
        }
        *self.inner.sink.lock() = None;
        let forwarder = self.inner.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
            let _ = forwarder.await;
        }
        info!("Transport manager stopped");
    }

    fn on_state_changed(&self, transport: &str, connected: bool) {
        let primary = self.primary();
        match (connected, primary.as_deref()) {
            (false, Some(current)) if current == transport => self.fail_over(transport),
            (true, None) => {
                *self.inner.primary.write() = Some(transport.to_string());
                info!(transport, "Primary transport restored");
            }
            _ => {}
        }
    }

    /// Promotes the first other connected transport, or clears the primary.
    fn fail_over(&self, from: &str) {
        let next = self
            .inner
            .transports
            .read()
            .iter()
            .find(|t| t.name() != from && t.is_connected())
            .map(|t| t.name().to_string());

        match &next {
            Some(name) => info!(from, to = %name, "Primary transport failed over"),
            None => warn!(from, "Primary transport lost; no connected replacement"),
        }
        *self.inner.primary.write() = next;
    }
}

// ============================================================================
// TransportManager - Sending
// ============================================================================

impl TransportManager {
    fn record(&self, message: &str) -> u64 {
        self.inner.replay.lock().push(message)
    }

    /// Sends via the primary transport only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] if there is no connected
    /// primary.
    pub async fn send(&self, message: &str) -> Result<()> {
        let primary = self
            .primary()
            .and_then(|name| self.transport(&name))
            .filter(|t| t.is_connected())
            .ok_or_else(|| Error::transport_unavailable("no connected primary transport"))?;

        self.record(message);
        primary.send(message).await
    }

    /// Sends via every connected transport.
    ///
    /// One transport failing never affects delivery through the others.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let targets: Vec<Arc<dyn Transport>> = self
            .inner
            .transports
            .read()
            .iter()
            .filter(|t| t.is_connected())
            .cloned()
            .collect();

        self.record(message);

        let outcomes = join_all(targets.iter().map(|t| async move {
            (t.name().to_string(), t.send(message).await)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    warn!(transport = %name, error = %e, "Broadcast delivery failed");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    /// Sends via one named transport.
    ///
    /// # Errors
    ///
    /// - [`Error::TransportNotFound`] for an unknown name
    /// - [`Error::TransportUnavailable`] if it is not connected
    pub async fn send_via_transport(&self, name: &str, message: &str) -> Result<()> {
        let transport = self.require(name)?;
        if !transport.is_connected() {
            return Err(Error::transport_unavailable(format!("{name} is not connected")));
        }
        self.record(message);
        transport.send(message).await
    }

    /// Sends to one connection of one transport, typically the reply to a
    /// request that arrived there.
    ///
    /// # Errors
    ///
    /// - [`Error::TransportNotFound`] for an unknown transport
    /// - [`Error::ConnectionNotFound`] for an unknown connection
    pub async fn reply(&self, name: &str, connection: ConnectionId, message: &str) -> Result<()> {
        let transport = self.require(name)?;
        self.record(message);
        transport.send_to(connection, message).await
    }

    /// Messages recorded after sequence number `seq`, oldest first.
    #[must_use]
    pub fn replay_since(&self, seq: u64) -> Vec<ReplayEntry> {
        self.inner
            .replay
            .lock()
            .entries
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect()
    }

    /// Manager snapshot.
    #[must_use]
    pub fn stats(&self) -> TransportManagerStats {
        TransportManagerStats {
            primary: self.primary(),
            replay_buffered: self.inner.replay.lock().entries.len(),
            transports: self
                .inner
                .transports
                .read()
                .iter()
                .map(|t| t.stats())
                .collect(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
