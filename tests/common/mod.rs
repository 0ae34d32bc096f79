//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use browser_mcp_server::pool::{MidOptions, TopOptions};
use browser_mcp_server::transport::{
    ConnectionRegistry, EventSink, Outbound, TransportCapabilities, TransportKind, TransportStats,
};
use browser_mcp_server::{
    AutomationBackend, BrowserKind, ConnectionId, Error, ResourceId, ResourceLevel, Result,
    ToolCall, Transport,
};

/// How long a test waits for anything before failing.
pub const WAIT: Duration = Duration::from_secs(5);

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MockBackend
// ============================================================================

/// Backend that mints ids, counts executions and can be told to stall or die.
#[derive(Default)]
pub struct MockBackend {
    next: AtomicU64,
    calls: Mutex<FxHashMap<&'static str, usize>>,
    dead: Mutex<FxHashSet<ResourceId>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mint(&self, prefix: &str) -> ResourceId {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        ResourceId::new(format!("{prefix}-{n}"))
    }

    /// Executions of `tool` so far.
    pub fn calls(&self, tool: &str) -> usize {
        self.calls.lock().get(tool).copied().unwrap_or(0)
    }

    /// Makes liveness probes for `id` fail.
    pub fn kill(&self, id: &ResourceId) {
        self.dead.lock().insert(id.clone());
    }
}

#[async_trait]
impl AutomationBackend for MockBackend {
    async fn create_top(&self, _: BrowserKind, _: &TopOptions) -> Result<ResourceId> {
        Ok(self.mint("browser"))
    }

    async fn create_mid(&self, _: &ResourceId, _: &MidOptions) -> Result<ResourceId> {
        Ok(self.mint("context"))
    }

    async fn create_leaf(&self, _: &ResourceId) -> Result<ResourceId> {
        Ok(self.mint("page"))
    }

    async fn is_connected(&self, id: &ResourceId) -> bool {
        !self.dead.lock().contains(id)
    }

    async fn close(&self, _: &ResourceId, _: ResourceLevel) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, page: Option<&ResourceId>, call: &ToolCall) -> Result<Value> {
        *self.calls.lock().entry(call.name()).or_default() += 1;
        match call {
            // `sleep:<ms>` stalls, anything else echoes.
            ToolCall::Evaluate { script, .. } => {
                if let Some(ms) = script.strip_prefix("sleep:").and_then(|ms| ms.parse().ok()) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                Ok(json!({ "result": script }))
            }
            ToolCall::CurrentTitle { .. } => Ok(json!(format!("Title of {}", page.map_or("-", ResourceId::as_str)))),
            ToolCall::Version {} => Ok(json!({ "product": "MockBrowser/1.0" })),
            _ => Ok(json!({ "ok": true })),
        }
    }
}

// ============================================================================
// LoopbackTransport
// ============================================================================

/// In-memory transport whose clients are driven by the test.
pub struct LoopbackTransport {
    name: String,
    registry: ConnectionRegistry,
    failing: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            registry: ConnectionRegistry::new(name, TransportKind::Custom),
            failing: AtomicBool::new(false),
        })
    }

    /// Makes every send fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Attaches a new client.
    pub fn connect(self: &Arc<Self>) -> Client {
        let (id, outbound) = self.registry.open();
        Client {
            id,
            transport: Arc::clone(self),
            outbound,
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::transport_unavailable(format!("{} is failing", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Custom
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
        self.registry.attach(sink);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.registry.detach("stopped");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.registry.is_connected()
    }

    async fn send(&self, message: &str) -> Result<()> {
        self.check()?;
        self.registry.broadcast(message).map(|_| ())
    }

    async fn send_to(&self, connection: ConnectionId, message: &str) -> Result<()> {
        self.check()?;
        self.registry.send_to(connection, message)
    }

    fn stats(&self) -> TransportStats {
        self.registry.stats()
    }
}

// ============================================================================
// Client
// ============================================================================

/// One simulated client connection.
pub struct Client {
    pub id: ConnectionId,
    transport: Arc<LoopbackTransport>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Client {
    /// Sends raw envelope text.
    pub fn send(&self, text: &str) {
        self.transport.registry.received(self.id, text.to_string(), None);
    }

    /// Sends a JSON value.
    pub fn send_json(&self, value: &Value) {
        self.send(&value.to_string());
    }

    /// Next message, within [`WAIT`].
    pub async fn recv(&mut self) -> Value {
        loop {
            let item = timeout(WAIT, self.outbound.recv())
                .await
                .expect("message in time")
                .expect("connection open");
            if let Outbound::Text(text) = item {
                return serde_json::from_str(&text).expect("json message");
            }
        }
    }

    /// Next message matching `pred`; others are skipped.
    pub async fn recv_where(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        loop {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
    }

    /// Next notification with `method`.
    pub async fn notification(&mut self, method: &str) -> Value {
        self.recv_where(|m| m["method"] == method && m.get("id").is_none())
            .await
    }

    /// Sends a request and waits for its response.
    pub async fn request(&mut self, id: u64, method: &str, params: Value) -> Value {
        self.send_json(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }));
        self.recv_where(|m| m["id"] == json!(id) && m.get("method").is_none())
            .await
    }

    /// Completes the handshake.
    pub async fn initialize(&mut self) -> Value {
        self.request(
            0,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "integration", "version": "1.0.0" },
            }),
        )
        .await
    }

    /// Calls a tool and returns its response.
    pub async fn call_tool(&mut self, id: u64, name: &str, arguments: Value) -> Value {
        self.request(id, "tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    /// Drains without blocking; returns what was queued.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            if let Outbound::Text(text) = item {
                messages.push(serde_json::from_str(&text).expect("json message"));
            }
        }
        messages
    }

    /// Leaves.
    pub fn disconnect(self) {
        self.transport.registry.close(self.id, "client left");
    }
}

/// Parsed JSON of the first text content of a tool result.
pub fn tool_json(response: &Value) -> Value {
    let text = response["result"]["content"][0]["text"]
        .as_str()
        .expect("text content");
    serde_json::from_str(text).expect("json text")
}

/// Polls `cond` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
