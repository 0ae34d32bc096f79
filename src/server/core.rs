//! Server assembly and relays.
//!
//! A [`Server`] owns one instance of every component and runs three relay
//! tasks while started:
//!
//! | Relay | From | To |
//! |-------|------|----|
//! | inbound | [`TransportManager`] events | rate limiter, [`ProtocolEngine`], reply path |
//! | signals | [`EngineSignal`]s | transports (unicast or broadcast), [`EventBus`] |
//! | pool | [`PoolEvent`]s | [`EventBus`], response cache invalidation |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheStats, PolicyTable, ResponseCache, SessionCache, SessionCacheStats};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventBusStats, EventCategory, EventSource, Severity};
use crate::identifiers::{ConnectionId, RequestId};
use crate::pool::{AutomationBackend, CloseReason, PoolEvent, PoolStats, ResourceLevel, ResourcePool};
use crate::protocol::{
    EngineSignal, EngineStats, Implementation, Message, Notification, Origin, PROTOCOL_VERSION,
    ProtocolEngine, Response,
};
use crate::transport::{RateLimiter, Transport, TransportEvent, TransportManager, TransportManagerStats};

use super::builder::ServerBuilder;
use super::catalog::{self, POOL_STATS_URI};
use super::handler::{ServerHandler, invalidate_page};

// ============================================================================
// ServerStats
// ============================================================================

/// Snapshot of every component.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Whether the server is started.
    pub running: bool,
    /// Seconds since start, zero while stopped.
    pub uptime_seconds: u64,
    /// Protocol engine counters.
    pub engine: EngineStats,
    /// Pool occupancy.
    pub pool: PoolStats,
    /// Response cache counters.
    pub cache: CacheStats,
    /// Session cache counters.
    pub sessions: SessionCacheStats,
    /// Event bus counters.
    pub events: EventBusStats,
    /// Transport routing and traffic.
    pub transports: TransportManagerStats,
    /// Connections with live rate windows.
    pub rate_limited_connections: usize,
}

// ============================================================================
// Bridge
// ============================================================================

/// Component handles shared by the relay tasks.
///
/// Holds clones rather than the server itself so relays never keep the
/// server alive.
#[derive(Clone)]
struct Bridge {
    engine: ProtocolEngine,
    transports: TransportManager,
    events: EventBus,
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
    server_info: Implementation,
}

impl Bridge {
    // ========================================================================
    // Inbound
    // ========================================================================

    async fn run_inbound(self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message {
                    transport,
                    connection,
                    payload,
                    reply,
                } => {
                    // Each message runs on its own task so a cancellation can
                    // overtake the request it cancels.
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        bridge.on_message(transport, connection, payload, reply).await;
                    });
                }
                TransportEvent::Connected {
                    transport,
                    connection,
                } => self.on_connected(&transport, connection).await,
                TransportEvent::Disconnected {
                    transport,
                    connection,
                    reason,
                } => self.on_disconnected(&transport, connection, &reason),
                TransportEvent::StateChanged {
                    transport,
                    connected,
                } => self.on_state_changed(&transport, connected).await,
            }
        }
        debug!("Inbound relay ended");
    }

    async fn process(&self, origin: Origin, payload: &str) -> Option<String> {
        match self.limiter.check(origin.connection) {
            Ok(()) => self.engine.handle_message(payload, Some(origin)).await,
            Err(e) => {
                warn!(connection = %origin.connection, error = %e, "Rejecting rate-limited message");
                rejection(payload, &e)
            }
        }
    }

    async fn on_message(
        &self,
        transport: String,
        connection: ConnectionId,
        payload: String,
        reply: Option<oneshot::Sender<String>>,
    ) {
        let origin = Origin::new(transport.clone(), connection);
        let Some(text) = self.process(origin, &payload).await else {
            return;
        };

        match reply {
            Some(reply) => {
                if reply.send(text).is_err() {
                    debug!(connection = %connection, "Requester left before the reply");
                }
            }
            None => {
                if let Err(e) = self.transports.reply(&transport, connection, &text).await {
                    debug!(transport = %transport, connection = %connection, error = %e, "Reply not delivered");
                }
            }
        }
    }

    async fn on_connected(&self, transport: &str, connection: ConnectionId) {
        let welcome = Notification::new(
            "notifications/welcome",
            Some(json!({
                "connectionId": connection,
                "transport": transport,
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": self.server_info,
            })),
        );
        let text = Message::from(welcome).to_json();
        if let Err(e) = self.transports.reply(transport, connection, &text).await {
            debug!(transport, connection = %connection, error = %e, "Welcome not delivered");
        }

        self.events.publish(
            Event::new("connection.opened", EventCategory::Transport)
                .with_data(json!({ "transport": transport, "connectionId": connection })),
        );
    }

    fn on_disconnected(&self, transport: &str, connection: ConnectionId, reason: &str) {
        let subscriptions = self.events.remove_by_owner(connection);
        self.limiter.remove(connection);
        let cancelled = self.engine.remove_origin(&Origin::new(transport, connection));
        debug!(transport, connection = %connection, reason, subscriptions, cancelled, "Connection released");

        self.events.publish(
            Event::new("connection.closed", EventCategory::Transport).with_data(json!({
                "transport": transport,
                "connectionId": connection,
                "reason": reason,
            })),
        );
    }

    async fn on_state_changed(&self, transport: &str, connected: bool) {
        let event = if connected {
            let notification = Notification::new(
                "notifications/transport/connected",
                Some(json!({ "transport": transport })),
            );
            let report = self.transports.broadcast(&Message::from(notification).to_json()).await;
            trace!(transport, delivered = report.delivered.len(), "Announced transport");
            Event::new("transport.connected", EventCategory::Transport)
        } else {
            Event::new("transport.disconnected", EventCategory::Transport)
                .with_severity(Severity::Warning)
        };
        self.events.publish(event.with_data(json!({
            "transport": transport,
            "primary": self.transports.primary(),
        })));
    }

    // ========================================================================
    // Engine signals
    // ========================================================================

    async fn run_signals(self, mut signals: broadcast::Receiver<EngineSignal>) {
        loop {
            match signals.recv().await {
                Ok(signal) => self.on_signal(signal).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Signal relay lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Signal relay ended");
    }

    async fn on_signal(&self, signal: EngineSignal) {
        match signal {
            EngineSignal::Notification {
                target,
                notification,
            } => self.deliver(target, notification).await,
            EngineSignal::ListChanged(kind) => {
                self.deliver(None, Notification::new(kind.notification_method(), None))
                    .await;
            }
            EngineSignal::Initialized { client } => {
                self.events.publish(
                    Event::new("client.initialized", EventCategory::Lifecycle)
                        .with_data(json!({ "client": client })),
                );
            }
            EngineSignal::RequestTimedOut { request_id, method } => {
                self.events.publish(
                    Event::new("request.timeout", EventCategory::Error)
                        .with_severity(Severity::Warning)
                        .with_data(json!({ "requestId": request_id, "method": method })),
                );
            }
            EngineSignal::RequestCancelled { request_id } => {
                self.events.publish(
                    Event::new("request.cancelled", EventCategory::Tool)
                        .with_data(json!({ "requestId": request_id })),
                );
            }
            EngineSignal::LogLevelChanged(level) => {
                debug!(?level, "Client log level changed");
            }
        }
    }

    async fn deliver(&self, target: Option<Origin>, notification: Notification) {
        let method = notification.method.clone();
        let text = Message::from(notification).to_json();
        match target {
            Some(origin) => {
                if let Err(e) = self
                    .transports
                    .reply(&origin.transport, origin.connection, &text)
                    .await
                {
                    debug!(method = %method, connection = %origin.connection, error = %e, "Notification not delivered");
                }
            }
            None => {
                let report = self.transports.broadcast(&text).await;
                if !report.failed.is_empty() {
                    debug!(method = %method, failed = ?report.failed, "Broadcast partially failed");
                }
            }
        }
    }

    // ========================================================================
    // Pool events
    // ========================================================================

    async fn run_pool_events(self, mut pool_events: broadcast::Receiver<PoolEvent>) {
        loop {
            match pool_events.recv().await {
                Ok(event) => self.on_pool_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Pool relay lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Pool relay ended");
    }

    fn on_pool_event(&self, event: &PoolEvent) {
        let (action, level) = match event {
            PoolEvent::Created { level, .. } => ("created", *level),
            PoolEvent::Reused { level, .. } => ("reused", *level),
            PoolEvent::Closed { level, .. } => ("closed", *level),
        };

        let id = event.id().clone();
        if matches!(event, PoolEvent::Closed { .. }) && level == ResourceLevel::Leaf {
            invalidate_page(&self.cache, &id);
        }

        // Tree depth matches level, so the lineage fills the slots in order.
        let mut lineage = event.ancestors().iter().cloned().chain(std::iter::once(id));
        let source = EventSource {
            browser_id: lineage.next(),
            context_id: lineage.next(),
            page_id: lineage.next(),
        };
        let severity = match event {
            PoolEvent::Closed {
                reason: CloseReason::Disconnected,
                ..
            } => Severity::Warning,
            _ => Severity::Info,
        };

        self.events.publish(
            Event::new(format!("{}.{action}", level.as_str()), EventCategory::Lifecycle)
                .with_severity(severity)
                .with_source(source)
                .with_data(serde_json::to_value(event).unwrap_or(Value::Null)),
        );
        self.engine.notify_resource_updated(POOL_STATS_URI);
    }
}

/// Error response for a message refused before dispatch.
///
/// Notifications are never answered.
fn rejection(payload: &str, error: &Error) -> Option<String> {
    let id = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("id") {
            Some(id) => serde_json::from_value::<RequestId>(id.clone()).ok(),
            None => return None,
        },
        _ => None,
    };
    Some(Message::from(Response::error(id, error)).to_json())
}

// ============================================================================
// Server
// ============================================================================

struct ServerInner {
    config: ServerConfig,
    bridge: Bridge,
    pool: ResourcePool,
    sessions: Arc<SessionCache>,
    pending: Mutex<Vec<(Arc<dyn Transport>, bool)>>,
    relays: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

/// Remote-automation server.
///
/// Cheap to clone; clones control the same server.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use browser_mcp_server::{AutomationBackend, Server};
///
/// # async fn example(backend: Arc<dyn AutomationBackend>) -> browser_mcp_server::Result<()> {
/// let server = Server::builder()
///     .backend(backend)
///     .websocket()
///     .sse()
///     .build()?;
///
/// server.start().await?;
/// // ...
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.bridge.server_info.name)
            .field("running", &self.is_running())
            .field("transports", &self.inner.bridge.transports.names())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Wires every component. Transports are registered on [`start`](Self::start).
    pub(crate) fn assemble(
        config: ServerConfig,
        backend: Arc<dyn AutomationBackend>,
        policies: PolicyTable,
        transports: Vec<(Arc<dyn Transport>, bool)>,
    ) -> Self {
        let pool = ResourcePool::new(config.pool.clone(), backend);
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let sessions = Arc::new(SessionCache::new(config.session_cache.clone()));
        let events = EventBus::new(config.events.clone());

        let handler = ServerHandler::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&sessions),
            events.clone(),
            policies,
            config.cache.enabled,
        );
        let server_info = Implementation {
            name: config.server.name.clone(),
            version: config.server.version.clone(),
        };
        let engine = ProtocolEngine::new(config.protocol.clone(), server_info.clone(), Arc::new(handler));
        catalog::install(&engine);

        let bridge = Bridge {
            engine,
            transports: TransportManager::new(config.transport.replay_buffer),
            events,
            cache,
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            server_info,
        };

        Self {
            inner: Arc::new(ServerInner {
                config,
                bridge,
                pool,
                sessions,
                pending: Mutex::new(transports),
                relays: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                started_at: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Registers and starts the transports, the relays and every periodic
    /// maintenance task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if already running, or the first
    /// transport registration or start failure.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::internal("server already running"));
        }

        match self.start_components().await {
            Ok(()) => {
                *self.inner.started_at.lock() = Some(Utc::now());
                info!(
                    name = %self.inner.bridge.server_info.name,
                    transports = ?self.inner.bridge.transports.names(),
                    "Server started"
                );
                Ok(())
            }
            Err(e) => {
                self.stop_components().await;
                self.inner.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn start_components(&self) -> Result<()> {
        let bridge = &self.inner.bridge;

        // Subscribe before anything can emit.
        let signals = bridge.engine.subscribe();
        let pool_events = self.inner.pool.subscribe();

        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for (transport, primary) in pending {
            bridge.transports.register(transport, primary).await?;
        }
        let inbound = bridge.transports.start().await?;

        {
            let mut relays = self.inner.relays.lock();
            relays.push(tokio::spawn(bridge.clone().run_signals(signals)));
            relays.push(tokio::spawn(bridge.clone().run_pool_events(pool_events)));
            relays.push(tokio::spawn(bridge.clone().run_inbound(inbound)));
        }

        bridge.cache.start_cleanup();
        self.inner.sessions.start_cleanup();
        bridge.events.start_maintenance();
        self.inner.pool.start_sweeper();
        Ok(())
    }

    async fn stop_components(&self) {
        let bridge = &self.inner.bridge;
        bridge.transports.stop().await;

        let relays = std::mem::take(&mut *self.inner.relays.lock());
        for relay in relays {
            relay.abort();
            let _ = relay.await;
        }

        self.inner.pool.cleanup().await;
        bridge.cache.shutdown().await;
        self.inner.sessions.shutdown().await;
        bridge.events.shutdown().await;
    }

    /// Stops transports, relays and periodic tasks, then closes every pooled
    /// resource. Does nothing if not running.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down server");
        self.stop_components().await;
        *self.inner.started_at.lock() = None;
        info!("Server stopped");
    }

    /// Whether [`start`](Self::start) succeeded and no shutdown followed.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ========================================================================
    // In-process dispatch
    // ========================================================================

    /// Handles one envelope as if it arrived from `origin`, rate limit
    /// included. Returns the reply text, if any.
    pub async fn process(&self, origin: Origin, payload: &str) -> Option<String> {
        self.inner.bridge.process(origin, payload).await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The protocol engine.
    #[must_use]
    pub fn engine(&self) -> &ProtocolEngine {
        &self.inner.bridge.engine
    }

    /// The resource pool.
    #[must_use]
    pub fn pool(&self) -> &ResourcePool {
        &self.inner.pool
    }

    /// The response cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.bridge.cache
    }

    /// The session-state cache.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.inner.sessions
    }

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.bridge.events
    }

    /// The transport manager.
    #[must_use]
    pub fn transports(&self) -> &TransportManager {
        &self.inner.bridge.transports
    }

    /// Snapshot of every component.
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        let bridge = &self.inner.bridge;
        let started_at = *self.inner.started_at.lock();
        let uptime_seconds = started_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0);

        ServerStats {
            running: self.is_running(),
            uptime_seconds,
            engine: bridge.engine.stats(),
            pool: self.inner.pool.stats(),
            cache: bridge.cache.stats(),
            sessions: self.inner.sessions.stats(),
            events: bridge.events.stats(),
            transports: bridge.transports.stats(),
            rate_limited_connections: bridge.limiter.tracked(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
