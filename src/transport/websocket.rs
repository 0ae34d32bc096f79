//! WebSocket transport.
//!
//! Binds one port and accepts any number of clients. Each accepted socket
//! gets a task that multiplexes inbound frames, its outbound queue and a
//! ping/pong liveness check.
//!
//! # Close Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 1001 | Server shutting down |
//! | 1009 | Inbound message exceeded the size limit |

// ============================================================================
// Imports
// ============================================================================

use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

use super::base::{EventSink, Transport, TransportCapabilities, TransportKind, TransportStats};
use super::connection::{ConnectionRegistry, Outbound};

// ============================================================================
// Constants
// ============================================================================

/// Close code for oversize inbound messages.
const CLOSE_TOO_LARGE: u16 = 1009;

/// Default transport name.
pub const DEFAULT_NAME: &str = "websocket";

// ============================================================================
// WebSocketTransport
// ============================================================================

struct WsInner {
    name: String,
    config: TransportConfig,
    registry: ConnectionRegistry,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Multi-client WebSocket server transport.
///
/// # Example
///
/// ```ignore
/// let ws = WebSocketTransport::new(config.transport.clone());
/// manager.register(Arc::new(ws.clone()), true).await?;
/// let events = manager.start().await?;
/// println!("listening on ws://{}", ws.local_addr().unwrap());
/// ```
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("name", &self.inner.name)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Creates a transport bound to `config.websocket_addr` on start.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self::with_name(DEFAULT_NAME, config)
    }

    /// Creates a transport with a custom routing name.
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: TransportConfig) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(WsInner {
                registry: ConnectionRegistry::new(name.clone(), TransportKind::WebSocket),
                name,
                config,
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Address actually bound, once started.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Connection table.
    #[inline]
    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }
}

// ============================================================================
// Transport impl
// ============================================================================

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            bidirectional: true,
            multi_client: true,
            request_response: false,
        }
    }

    async fn start(&self, sink: EventSink) -> Result<()> {
        if self.inner.registry.is_running() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.inner.config.websocket_addr).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);
        self.inner.registry.attach(sink);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(accept_loop(inner, listener));
        *self.inner.accept_task.lock() = Some(task);

        info!(transport = %self.inner.name, %addr, "WebSocket transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.registry.detach("server shutdown");
        info!(transport = %self.inner.name, "WebSocket transport stopped");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.registry.is_connected()
    }

    async fn send(&self, message: &str) -> Result<()> {
        self.inner.registry.broadcast(message).map(|_| ())
    }

    async fn send_to(&self, connection: ConnectionId, message: &str) -> Result<()> {
        self.inner.registry.send_to(connection, message)
    }

    fn stats(&self) -> TransportStats {
        self.inner.registry.stats()
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn accept_loop(inner: Arc<WsInner>, listener: TcpListener) {
    debug!(transport = %inner.name, "Accept loop started");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(inner, stream, addr).await {
                        warn!(error = %e, ?addr, "Connection handling failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
            }
        }
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// Runs one client socket until either side closes it.
async fn serve_connection(inner: Arc<WsInner>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    let registry = &inner.registry;
    let (id, mut outbound) = registry.open();
    info!(connection = %id, ?addr, "WebSocket client connected");

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let ping_interval = inner.config.ping_interval;
    let pong_timeout = inner.config.pong_timeout;
    let max_bytes = inner.config.max_message_bytes;

    let mut pings = interval_at(Instant::now() + ping_interval, ping_interval);
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > max_bytes {
                            registry.record_error(id);
                            warn!(connection = %id, size = text.len(), max = max_bytes, "Inbound message too large");
                            let _ = ws_write.send(close_message(CLOSE_TOO_LARGE, "message too large")).await;
                            break "message too large".to_string();
                        }
                        registry.received(id, text.as_str().to_string(), None);
                    }

                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }

                    Some(Ok(Message::Close(_))) => {
                        break "closed by client".to_string();
                    }

                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection = %id, "Ignoring binary frame");
                    }

                    // Pings are answered by the protocol layer.
                    Some(Ok(_)) => {}

                    Some(Err(e)) => {
                        registry.record_error(id);
                        break format!("socket error: {e}");
                    }

                    None => {
                        break "stream ended".to_string();
                    }
                }
            }

            item = outbound.recv() => {
                match item {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            registry.record_error(id);
                            break format!("write failed: {e}");
                        }
                    }

                    Some(Outbound::Close { code, reason }) => {
                        let _ = ws_write.send(close_message(code, &reason)).await;
                        break reason;
                    }

                    None => {
                        let _ = ws_write.close().await;
                        break "connection released".to_string();
                    }
                }
            }

            _ = pings.tick(), if pong_deadline.is_none() => {
                if let Err(e) = ws_write.send(Message::Ping(Vec::new().into())).await {
                    registry.record_error(id);
                    break format!("ping failed: {e}");
                }
                pong_deadline = Some(Instant::now() + pong_timeout);
            }

            () = async {
                match pong_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            } => {
                warn!(connection = %id, "Pong timeout");
                let _ = ws_write.close().await;
                break "pong timeout".to_string();
            }
        }
    };

    registry.close(id, &reason);
    info!(connection = %id, ?addr, reason = %reason, "WebSocket client disconnected");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    use crate::transport::base::TransportEvent;

    fn local_config() -> TransportConfig {
        TransportConfig {
            websocket_addr: "127.0.0.1:0".parse().expect("addr"),
            ..TransportConfig::default()
        }
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> (ConnectionId, String) {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("sink open");
            if let TransportEvent::Message {
                connection, payload, ..
            } = event
            {
                return (connection, payload);
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_socket() {
        let transport = WebSocketTransport::new(local_config());
        let (sink, mut events) = mpsc::unbounded_channel();
        transport.start(sink).await.expect("start");
        let addr = transport.local_addr().expect("bound");

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
        client
            .send(Message::Text(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#.into()))
            .await
            .expect("client send");

        let (connection, payload) = next_message(&mut events).await;
        assert!(payload.contains("ping"));
        assert!(transport.is_connected());

        transport.send_to(connection, "pong-reply").await.expect("reply");
        let reply = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("reply in time")
            .expect("stream open")
            .expect("frame");
        assert_eq!(reply, Message::Text("pong-reply".into()));

        transport.stop().await.expect("stop");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_oversize_message_closes_with_1009() {
        let config = TransportConfig {
            max_message_bytes: 8,
            ..local_config()
        };
        let transport = WebSocketTransport::new(config);
        let (sink, _events) = mpsc::unbounded_channel();
        transport.start(sink).await.expect("start");
        let addr = transport.local_addr().expect("bound");

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
        client
            .send(Message::Text("this is far too long".into()))
            .await
            .expect("client send");

        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("close in time")
            .expect("stream open")
            .expect("frame");
        match frame {
            Message::Close(Some(close)) => assert_eq!(u16::from(close.code), CLOSE_TOO_LARGE),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(transport.stats().errors, 1);

        transport.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_send_without_clients_is_unavailable() {
        let transport = WebSocketTransport::new(local_config());
        let (sink, _events) = mpsc::unbounded_channel();
        transport.start(sink).await.expect("start");

        assert!(matches!(
            transport.send("x").await,
            Err(Error::TransportUnavailable { .. })
        ));
        transport.stop().await.expect("stop");
    }
}
