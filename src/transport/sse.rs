//! Server-Sent Events transport with an HTTP request path.
//!
//! Routes:
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /sse` | Push stream; first event names the POST endpoint |
//! | `POST /message` | Single-shot exchange: one envelope in, its reply in the body |
//! | `GET /status` | Read-only status surface |
//!
//! A POST never uses the push stream. A `sessionId` query parameter ties the
//! exchange to a stream connection for notification routing; without it the
//! exchange runs under the transport's anonymous connection id.

// ============================================================================
// Imports
// ============================================================================

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::error::Result;
use crate::identifiers::ConnectionId;

use super::base::{EventSink, Transport, TransportCapabilities, TransportKind, TransportStats};
use super::connection::{ConnectionRegistry, Outbound};

// ============================================================================
// Constants
// ============================================================================

/// Push stream route.
pub const SSE_PATH: &str = "/sse";

/// Single-shot request route.
pub const MESSAGE_PATH: &str = "/message";

/// Status route.
pub const STATUS_PATH: &str = "/status";

/// Default transport name.
pub const DEFAULT_NAME: &str = "sse";

// ============================================================================
// SseTransport
// ============================================================================

struct SseInner {
    name: String,
    config: TransportConfig,
    registry: ConnectionRegistry,
    anonymous: ConnectionId,
    started_at: Mutex<Option<Instant>>,
    local_addr: Mutex<Option<SocketAddr>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

/// HTTP transport: SSE push stream plus POST request path.
#[derive(Clone)]
pub struct SseTransport {
    inner: Arc<SseInner>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("name", &self.inner.name)
            .field("local_addr", &self.local_addr())
            .field("streams", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl SseTransport {
    /// Creates a transport bound to `config.http_addr` on start.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self::with_name(DEFAULT_NAME, config)
    }

    /// Creates a transport with a custom routing name.
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: TransportConfig) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(SseInner {
                registry: ConnectionRegistry::new(name.clone(), TransportKind::Sse),
                name,
                config,
                anonymous: ConnectionId::generate(),
                started_at: Mutex::new(None),
                local_addr: Mutex::new(None),
                server_task: Mutex::new(None),
            }),
        }
    }

    /// Address actually bound, once started.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Connection id used for POSTs that carry no `sessionId`.
    #[inline]
    #[must_use]
    pub fn anonymous_connection(&self) -> ConnectionId {
        self.inner.anonymous
    }

    /// The HTTP routes, for mounting into a larger application.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(SSE_PATH, get(sse_handler))
            .route(MESSAGE_PATH, post(message_handler))
            .route(STATUS_PATH, get(status_handler))
            .with_state(Arc::clone(&self.inner))
    }
}

// ============================================================================
// Transport impl
// ============================================================================

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            bidirectional: false,
            multi_client: true,
            request_response: true,
        }
    }

    async fn start(&self, sink: EventSink) -> Result<()> {
        if self.inner.registry.is_running() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.inner.config.http_addr).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);
        *self.inner.started_at.lock() = Some(Instant::now());
        self.inner.registry.attach(sink);

        let app = self.router();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "HTTP server error");
            }
        });
        *self.inner.server_task.lock() = Some(task);

        info!(transport = %self.inner.name, %addr, "SSE transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.registry.detach("server shutdown");
        let task = self.inner.server_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        *self.inner.started_at.lock() = None;
        info!(transport = %self.inner.name, "SSE transport stopped");
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
// Handlers
// ============================================================================

/// Closes the registry entry when the client drops the stream.
struct StreamGuard {
    inner: Arc<SseInner>,
    id: ConnectionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.inner.registry.close(self.id, "stream closed");
    }
}

async fn sse_handler(State(inner): State<Arc<SseInner>>) -> Response {
    if !inner.registry.is_running() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let (id, outbound) = inner.registry.open();
    info!(connection = %id, "SSE stream opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGE_PATH}?sessionId={id}"));

    let messages = UnboundedReceiverStream::new(outbound).map_while(|item| match item {
        Outbound::Text(text) => Some(Ok::<_, Infallible>(Event::default().event("message").data(text))),
        Outbound::Close { .. } => None,
    });

    let keep_alive = KeepAlive::new().interval(inner.config.keep_alive_interval);
    let guard = StreamGuard { inner, id };
    let stream = tokio_stream::once(Ok(endpoint))
        .chain(messages)
        .map(move |event| {
            let _guard = &guard;
            event
        });

    Sse::new(stream).keep_alive(keep_alive).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: Option<ConnectionId>,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn message_handler(
    State(inner): State<Arc<SseInner>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    if !inner.registry.is_running() {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "transport not running");
    }

    let connection = match query.session_id {
        Some(id) if inner.registry.contains(id) => id,
        Some(id) => {
            return error_body(StatusCode::NOT_FOUND, format!("unknown session {id}"));
        }
        None => inner.anonymous,
    };

    if body.len() > inner.config.max_message_bytes {
        inner.registry.record_error(connection);
        warn!(connection = %connection, size = body.len(), "POST body too large");
        return error_body(StatusCode::PAYLOAD_TOO_LARGE, "message too large");
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    inner.registry.received(connection, body, Some(reply_tx));

    match timeout(inner.config.post_response_timeout, reply_rx).await {
        Ok(Ok(reply)) => ([(header::CONTENT_TYPE, "application/json")], reply).into_response(),
        Ok(Err(_)) => {
            debug!(connection = %connection, "POST produced no reply");
            StatusCode::ACCEPTED.into_response()
        }
        Err(_) => {
            inner.registry.record_error(connection);
            error_body(StatusCode::GATEWAY_TIMEOUT, "no response within the timeout")
        }
    }
}

async fn status_handler(State(inner): State<Arc<SseInner>>) -> Response {
    let started = *inner.started_at.lock();
    let uptime_seconds = started.map_or(0, |at| at.elapsed().as_secs());
    let capabilities = TransportCapabilities {
        streaming: true,
        bidirectional: false,
        multi_client: true,
        request_response: true,
    };

    Json(json!({
        "online": inner.registry.is_running(),
        "transport": inner.name,
        "connections": inner.registry.len(),
        "uptimeSeconds": uptime_seconds,
        "capabilities": capabilities,
    }))
    .into_response()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use axum::body::to_bytes;
    use tokio::sync::mpsc;

    use crate::transport::base::TransportEvent;

    fn transport() -> (SseTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let config = TransportConfig {
            http_addr: "127.0.0.1:0".parse().expect("addr"),
            post_response_timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        };
        let transport = SseTransport::new(config);
        let (sink, events) = mpsc::unbounded_channel();
        transport.inner.registry.attach(sink);
        (transport, events)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn test_post_returns_reply_in_body() {
        let (transport, mut events) = transport();
        let inner = Arc::clone(&transport.inner);

        let post = tokio::spawn(message_handler(
            State(inner),
            Query(MessageQuery::default()),
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string(),
        ));

        match events.recv().await.expect("event") {
            TransportEvent::Message {
                connection, reply, ..
            } => {
                assert_eq!(connection, transport.anonymous_connection());
                reply
                    .expect("reply channel")
                    .send(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.into())
                    .expect("send reply");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let response = post.await.expect("join");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], 1);
    }

    #[tokio::test]
    async fn test_post_without_reply_is_accepted() {
        let (transport, mut events) = transport();
        let post = tokio::spawn(message_handler(
            State(Arc::clone(&transport.inner)),
            Query(MessageQuery::default()),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string(),
        ));

        // Dropping the event drops the reply sender.
        drop(events.recv().await.expect("event"));
        let response = post.await.expect("join");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_post_with_unknown_session_is_rejected() {
        let (transport, _events) = transport();
        let response = message_handler(
            State(Arc::clone(&transport.inner)),
            Query(MessageQuery {
                session_id: Some(ConnectionId::generate()),
            }),
            "{}".to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_announces_endpoint_then_relays() {
        let (transport, _events) = transport();
        let response = sse_handler(State(Arc::clone(&transport.inner))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(transport.is_connected());

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.expect("chunk").expect("bytes");
        let first = String::from_utf8_lossy(&first);
        assert!(first.contains("event: endpoint"));
        assert!(first.contains("/message?sessionId="));

        transport.send("hello").await.expect("broadcast");
        let second = body.next().await.expect("chunk").expect("bytes");
        assert!(String::from_utf8_lossy(&second).contains("data: hello"));

        drop(body);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_status_surface() {
        let (transport, _events) = transport();
        let status = body_json(status_handler(State(Arc::clone(&transport.inner))).await).await;
        assert_eq!(status["online"], true);
        assert_eq!(status["connections"], 0);
        assert_eq!(status["capabilities"]["requestResponse"], true);
    }
}
