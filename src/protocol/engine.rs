//! Protocol engine: handshake, dispatch, cancellation, timeouts and batching.
//!
//! The engine turns inbound text into outbound text. It owns the tool,
//! resource and prompt registries and the in-flight request table, and
//! delegates execution to a [`RequestHandler`].
//!
//! # Request lifecycle
//!
//! ```text
//! handle_request ──► track ──► spawn(dispatch)
//!                                  │
//!          ┌───────────────────────┼────────────────────────┐
//!      completes               cancelled                 timeout
//!   response (ok/err)      no response, work          -32001 response
//!                          left to finish alone       + RequestTimedOut
//! ```
//!
//! In every case the [`TrackGuard`](super::tracker::TrackGuard) drops before
//! the call returns, so the table never leaks entries.
//!
//! Side effects addressed to clients (progress, resource updates, log
//! messages, list changes) leave the engine as [`EngineSignal`]s on a
//! broadcast channel. Routing them to transports is the caller's job.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, ProgressToken, RequestId};

use super::command::ToolCall;
use super::registry::{Prompt, PromptRegistry, ResourceRegistry, ToolRegistry};
use super::request::{
    Envelope, Incoming, Message, Notification, Request, Response, parse_incoming,
};
use super::tracker::{ProgressSnapshot, RequestState, RequestTracker};
use super::types::{
    CallToolParams, CallToolResult, CancelledParams, GetPromptParams, GetPromptResult,
    Implementation, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, LogLevel,
    LoggingMessageParams, PROTOCOL_VERSION, ProgressParams, ReadResourceResult,
    RequestMeta, ResourceDefinition, ResourceTemplate, ResourceUriParams, ServerCapabilities,
    SetLevelParams, ToolDefinition,
};

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the signal channel. Lagging receivers lose the oldest signals.
const SIGNAL_CAPACITY: usize = 256;

// ============================================================================
// Origin
// ============================================================================

/// Which connection on which transport a message came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    /// Transport name.
    pub transport: String,
    /// Connection on that transport.
    pub connection: ConnectionId,
}

impl Origin {
    /// Creates an origin.
    #[must_use]
    pub fn new(transport: impl Into<String>, connection: ConnectionId) -> Self {
        Self {
            transport: transport.into(),
            connection,
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Registry whose contents changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Tools.
    Tools,
    /// Resources or resource templates.
    Resources,
    /// Prompts.
    Prompts,
}

impl ListKind {
    /// Notification method announcing the change.
    #[must_use]
    pub const fn notification_method(self) -> &'static str {
        match self {
            Self::Tools => "notifications/tools/list_changed",
            Self::Resources => "notifications/resources/list_changed",
            Self::Prompts => "notifications/prompts/list_changed",
        }
    }
}

/// Something the engine wants the outside world to know.
#[derive(Debug, Clone)]
pub enum EngineSignal {
    /// Deliver a notification; `None` means every connection.
    Notification {
        /// Recipient connection.
        target: Option<Origin>,
        /// Notification to send.
        notification: Notification,
    },
    /// First successful handshake.
    Initialized {
        /// Client identity.
        client: Implementation,
    },
    /// A request exceeded its timeout.
    RequestTimedOut {
        /// Timed-out request.
        request_id: RequestId,
        /// Its method.
        method: String,
    },
    /// A request was cancelled before completion.
    RequestCancelled {
        /// Cancelled request.
        request_id: RequestId,
    },
    /// A registry changed.
    ListChanged(ListKind),
    /// `logging/setLevel` changed the threshold.
    LogLevelChanged(LogLevel),
}

// ============================================================================
// Handler
// ============================================================================

/// Per-request context passed to the [`RequestHandler`].
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Id of the request being handled.
    pub request_id: RequestId,
    /// Connection the request came from.
    pub origin: Option<Origin>,
    /// Progress token from `_meta`, if the client supplied one.
    pub progress_token: Option<ProgressToken>,
    engine: ProtocolEngine,
}

impl CallContext {
    /// The engine handling the request.
    #[must_use]
    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Reports progress for this request. Does nothing without a token.
    pub fn progress(&self, progress: f64, total: Option<f64>, message: Option<String>) -> bool {
        match &self.progress_token {
            Some(token) => {
                self.engine
                    .report_progress(self.origin.as_ref(), token, progress, total, message)
            }
            None => false,
        }
    }
}

/// Executes what the engine advertises.
///
/// The engine validates envelopes and params; implementations only see
/// typed calls.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Executes one tool call.
    ///
    /// # Errors
    ///
    /// Resource and backend errors are reported to the client as a failed
    /// tool result; any other error becomes a JSON-RPC error response.
    async fn call_tool(&self, ctx: &CallContext, call: ToolCall) -> Result<CallToolResult>;

    /// Reads one resource.
    ///
    /// # Errors
    ///
    /// Any error becomes a JSON-RPC error response.
    async fn read_resource(&self, ctx: &CallContext, uri: &str) -> Result<ReadResourceResult>;

    /// Renders a prompt. Defaults to plain template substitution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] if a required argument is missing.
    async fn get_prompt(
        &self,
        _ctx: &CallContext,
        prompt: &Prompt,
        arguments: &BTreeMap<String, String>,
    ) -> Result<GetPromptResult> {
        prompt.render(arguments)
    }
}

// ============================================================================
// EngineStats
// ============================================================================

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Whether the handshake completed.
    pub initialized: bool,
    /// Requests received, batch members included.
    pub received: u64,
    /// Requests answered with a result.
    pub completed: u64,
    /// Requests answered with an error.
    pub failed: u64,
    /// Requests cancelled before completion.
    pub cancelled: u64,
    /// Requests that timed out.
    pub timed_out: u64,
    /// Requests currently tracked.
    pub in_flight: usize,
}

// ============================================================================
// ProtocolEngine
// ============================================================================

struct EngineInner {
    config: ProtocolConfig,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    handler: Arc<dyn RequestHandler>,
    initialized: AtomicBool,
    client: RwLock<Option<InitializeParams>>,
    tools: RwLock<ToolRegistry>,
    resources: RwLock<ResourceRegistry>,
    prompts: RwLock<PromptRegistry>,
    resource_subscriptions: RwLock<FxHashMap<String, FxHashSet<Option<Origin>>>>,
    log_level: RwLock<LogLevel>,
    tracker: RequestTracker,
    signals: broadcast::Sender<EngineSignal>,
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

/// JSON-RPC protocol engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("server", &self.inner.server_info.name)
            .field("initialized", &self.is_initialized())
            .field("in_flight", &self.inner.tracker.len())
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// Creates an engine with empty registries.
    #[must_use]
    pub fn new(
        config: ProtocolConfig,
        server_info: Implementation,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                config,
                server_info,
                capabilities: ServerCapabilities::default(),
                handler,
                initialized: AtomicBool::new(false),
                client: RwLock::new(None),
                tools: RwLock::new(ToolRegistry::default()),
                resources: RwLock::new(ResourceRegistry::default()),
                prompts: RwLock::new(PromptRegistry::default()),
                resource_subscriptions: RwLock::new(FxHashMap::default()),
                log_level: RwLock::new(LogLevel::default()),
                tracker: RequestTracker::new(),
                signals,
                received: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to engine signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineSignal> {
        self.inner.signals.subscribe()
    }

    fn signal(&self, signal: EngineSignal) {
        // No receivers is fine: nothing is listening yet.
        let _ = self.inner.signals.send(signal);
    }

    /// Returns `true` once a handshake has succeeded.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Identity of the initialized client.
    #[must_use]
    pub fn client_info(&self) -> Option<Implementation> {
        self.inner.client.read().as_ref().map(|c| c.client_info.clone())
    }

    /// Current log notification threshold.
    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        *self.inner.log_level.read()
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            initialized: self.is_initialized(),
            received: self.inner.received.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
            in_flight: self.inner.tracker.len(),
        }
    }

    /// In-flight request table.
    #[must_use]
    pub fn tracker(&self) -> &RequestTracker {
        &self.inner.tracker
    }
}

// ============================================================================
// ProtocolEngine - Inbound
// ============================================================================

enum Outcome {
    Finished(std::result::Result<Result<Value>, tokio::task::JoinError>),
    Cancelled,
    TimedOut,
}

impl ProtocolEngine {
    /// Handles raw inbound text. Returns the reply text, if any.
    ///
    /// Notifications and batches made only of notifications produce no
    /// reply.
    pub async fn handle_message(&self, text: &str, origin: Option<Origin>) -> Option<String> {
        match parse_incoming(text) {
            Err(response) => {
                self.inner.received.fetch_add(1, Ordering::Relaxed);
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                Some(Message::from(response).to_json())
            }
            Ok(Incoming::Single(Envelope::Request(request))) => self
                .handle_request(request, origin)
                .await
                .map(|r| Message::from(r).to_json()),
            Ok(Incoming::Single(Envelope::Notification(notification))) => {
                self.handle_notification(&notification, origin.as_ref());
                None
            }
            Ok(Incoming::Batch(items)) => self
                .handle_batch(items, origin)
                .await
                .map(|responses| Message::Batch(responses).to_json()),
        }
    }

    /// Runs batch members concurrently and collects their responses.
    ///
    /// Returns `None` when no member produced a response.
    pub async fn handle_batch(
        &self,
        items: Vec<std::result::Result<Envelope, Response>>,
        origin: Option<Origin>,
    ) -> Option<Vec<Response>> {
        let members = items.into_iter().map(|item| {
            let engine = self.clone();
            let origin = origin.clone();
            async move {
                match item {
                    Err(response) => {
                        engine.inner.received.fetch_add(1, Ordering::Relaxed);
                        engine.inner.failed.fetch_add(1, Ordering::Relaxed);
                        Some(response)
                    }
                    Ok(Envelope::Request(request)) => engine.handle_request(request, origin).await,
                    Ok(Envelope::Notification(notification)) => {
                        engine.handle_notification(&notification, origin.as_ref());
                        None
                    }
                }
            }
        });

        let responses: Vec<Response> = join_all(members).await.into_iter().flatten().collect();
        (!responses.is_empty()).then_some(responses)
    }

    /// Handles one request.
    ///
    /// Returns `None` when the request was cancelled; a cancelled request is
    /// never answered.
    pub async fn handle_request(&self, request: Request, origin: Option<Origin>) -> Option<Response> {
        self.inner.received.fetch_add(1, Ordering::Relaxed);
        let Request {
            id, method, params, ..
        } = request;

        if method != "initialize" && !self.is_initialized() {
            return Some(self.fail(id, &Error::NotInitialized));
        }

        let in_flight = self.inner.tracker.len();
        if in_flight >= self.inner.config.max_in_flight {
            let err = Error::TooManyRequests {
                in_flight,
                max: self.inner.config.max_in_flight,
            };
            return Some(self.fail(id, &err));
        }

        let progress_token = RequestMeta::progress_token_of(params.as_ref());
        let (guard, cancel_rx) = match self.inner.tracker.track(
            id.clone(),
            &method,
            origin.clone(),
            progress_token.clone(),
        ) {
            Ok(tracked) => tracked,
            Err(e) => return Some(self.fail(id, &e)),
        };

        debug!(request_id = %id, method = %method, "Dispatching request");

        let ctx = CallContext {
            request_id: id.clone(),
            origin,
            progress_token,
            engine: self.clone(),
        };
        let work = {
            let method = method.clone();
            tokio::spawn(async move { ctx.engine.dispatch(&ctx, &method, params).await })
        };

        let timeout = self.inner.config.request_timeout;
        let outcome = tokio::select! {
            joined = work => Outcome::Finished(joined),
            Ok(()) = cancel_rx => Outcome::Cancelled,
            () = tokio::time::sleep(timeout) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::Finished(Ok(Ok(result))) => {
                guard.finish(RequestState::Completed);
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                Some(Response::success(id, result))
            }
            Outcome::Finished(Ok(Err(e))) => {
                guard.finish(RequestState::Completed);
                debug!(request_id = %id, method = %method, error = %e, "Request failed");
                Some(self.fail(id, &e))
            }
            Outcome::Finished(Err(join_error)) => {
                guard.finish(RequestState::Completed);
                warn!(request_id = %id, method = %method, error = %join_error, "Handler aborted");
                Some(self.fail(id, &Error::internal(format!("handler for {method} aborted"))))
            }
            Outcome::Cancelled => {
                self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
                self.signal(EngineSignal::RequestCancelled {
                    request_id: id.clone(),
                });
                debug!(request_id = %id, method = %method, "Request cancelled; completion will be discarded");
                None
            }
            Outcome::TimedOut => {
                guard.finish(RequestState::TimedOut);
                self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(request_id = %id, method = %method, timeout_ms, "Request timed out");
                self.signal(EngineSignal::RequestTimedOut {
                    request_id: id.clone(),
                    method,
                });
                Some(Response::error(
                    Some(id.clone()),
                    &Error::request_timeout(id, timeout_ms),
                ))
            }
        }
    }

    fn fail(&self, id: RequestId, error: &Error) -> Response {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        Response::error(Some(id), error)
    }

    /// Handles one notification. Unknown methods are logged and ignored.
    pub fn handle_notification(&self, notification: &Notification, origin: Option<&Origin>) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                debug!(?origin, "Client reported initialized");
            }
            "notifications/cancelled" | "cancelled" => {
                match parse_params::<CancelledParams>(notification.params.clone()) {
                    Ok(params) => {
                        let cancelled = self.inner.tracker.cancel(origin, &params.request_id);
                        debug!(
                            request_id = %params.request_id,
                            reason = params.reason.as_deref().unwrap_or(""),
                            cancelled,
                            "Cancellation notification"
                        );
                    }
                    Err(e) => warn!(error = %e, "Malformed cancellation notification"),
                }
            }
            other => {
                debug!(method = other, ?origin, "Ignoring unknown notification");
            }
        }
    }
}

// ============================================================================
// ProtocolEngine - Dispatch
// ============================================================================

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = match params {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(p) => p,
    };
    serde_json::from_value(params).map_err(|e| Error::invalid_params(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

impl ProtocolEngine {
    async fn dispatch(&self, ctx: &CallContext, method: &str, params: Option<Value>) -> Result<Value> {
        match method {
            "initialize" => to_value(&self.initialize(parse_params(params)?)?),
            "ping" => Ok(json!({})),

            "tools/list" => to_value(&ListToolsResult {
                tools: self.inner.tools.read().list(),
            }),
            "tools/call" => {
                let params: CallToolParams = parse_params(params)?;
                to_value(&self.call_tool(ctx, params).await?)
            }

            "resources/list" => to_value(&ListResourcesResult {
                resources: self.inner.resources.read().list(),
            }),
            "resources/templates/list" => to_value(&ListResourceTemplatesResult {
                resource_templates: self.inner.resources.read().templates(),
            }),
            "resources/read" => {
                let ResourceUriParams { uri } = parse_params(params)?;
                self.known_resource(&uri)?;
                to_value(&self.inner.handler.read_resource(ctx, &uri).await?)
            }
            "resources/subscribe" => {
                let ResourceUriParams { uri } = parse_params(params)?;
                self.known_resource(&uri)?;
                self.inner
                    .resource_subscriptions
                    .write()
                    .entry(uri)
                    .or_default()
                    .insert(ctx.origin.clone());
                Ok(json!({}))
            }
            "resources/unsubscribe" => {
                let ResourceUriParams { uri } = parse_params(params)?;
                let mut subs = self.inner.resource_subscriptions.write();
                if let Some(set) = subs.get_mut(&uri) {
                    set.remove(&ctx.origin);
                    if set.is_empty() {
                        subs.remove(&uri);
                    }
                }
                Ok(json!({}))
            }

            "prompts/list" => to_value(&ListPromptsResult {
                prompts: self.inner.prompts.read().list(),
            }),
            "prompts/get" => {
                let params: GetPromptParams = parse_params(params)?;
                let prompt = self
                    .inner
                    .prompts
                    .read()
                    .get(&params.name)
                    .cloned()
                    .ok_or_else(|| Error::invalid_params(format!("Unknown prompt: {}", params.name)))?;
                let result = self
                    .inner
                    .handler
                    .get_prompt(ctx, &prompt, &params.arguments)
                    .await?;
                to_value(&result)
            }

            "logging/setLevel" => {
                let SetLevelParams { level } = parse_params(params)?;
                *self.inner.log_level.write() = level;
                info!(?level, "Log level changed");
                self.signal(EngineSignal::LogLevelChanged(level));
                Ok(json!({}))
            }

            "cancelled" | "notifications/cancelled" => {
                let params: CancelledParams = parse_params(params)?;
                if params.request_id == ctx.request_id {
                    return Err(Error::invalid_params("a request cannot cancel itself"));
                }
                let cancelled = self
                    .inner
                    .tracker
                    .cancel(ctx.origin.as_ref(), &params.request_id);
                Ok(json!({ "cancelled": cancelled }))
            }

            other => Err(Error::method_not_found(other)),
        }
    }

    fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        if params.protocol_version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                requested: params.protocol_version,
                supported: PROTOCOL_VERSION.to_string(),
            });
        }

        let client = params.client_info.clone();
        *self.inner.client.write() = Some(params);

        if !self.inner.initialized.swap(true, Ordering::AcqRel) {
            info!(client = %client.name, version = %client.version, "Client initialized");
            self.signal(EngineSignal::Initialized { client });
        }

        Ok(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.inner.capabilities.clone(),
            server_info: self.inner.server_info.clone(),
            instructions: None,
        })
    }

    async fn call_tool(&self, ctx: &CallContext, params: CallToolParams) -> Result<CallToolResult> {
        if !self.inner.tools.read().contains(&params.name) {
            return Err(Error::invalid_params(format!("Unknown tool: {}", params.name)));
        }
        let call = ToolCall::from_params(&params.name, params.arguments)?;

        match self.inner.handler.call_tool(ctx, call).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_resource_error() => {
                debug!(tool = %params.name, error = %e, "Tool failed");
                let mut result = CallToolResult::error(e.to_string());
                if let Some(data) = e.data() {
                    result.content.push(super::types::Content::text(data.to_string()));
                }
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    fn known_resource(&self, uri: &str) -> Result<()> {
        if self.inner.resources.read().knows(uri) {
            Ok(())
        } else {
            Err(Error::invalid_params(format!("Unknown resource: {uri}")))
        }
    }
}

// ============================================================================
// ProtocolEngine - Registries
// ============================================================================

impl ProtocolEngine {
    /// Registers or replaces a tool.
    pub fn register_tool(&self, tool: ToolDefinition) {
        self.inner.tools.write().register(tool);
        self.signal(EngineSignal::ListChanged(ListKind::Tools));
    }

    /// Removes a tool.
    pub fn unregister_tool(&self, name: &str) -> bool {
        let removed = self.inner.tools.write().unregister(name);
        if removed {
            self.signal(EngineSignal::ListChanged(ListKind::Tools));
        }
        removed
    }

    /// Registered tools.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.inner.tools.read().list()
    }

    /// Registers or replaces a resource.
    pub fn register_resource(&self, resource: ResourceDefinition) {
        self.inner.resources.write().register(resource);
        self.signal(EngineSignal::ListChanged(ListKind::Resources));
    }

    /// Registers or replaces a resource template.
    pub fn register_resource_template(&self, template: ResourceTemplate) {
        self.inner.resources.write().register_template(template);
        self.signal(EngineSignal::ListChanged(ListKind::Resources));
    }

    /// Removes a resource.
    pub fn unregister_resource(&self, uri: &str) -> bool {
        let removed = self.inner.resources.write().unregister(uri);
        if removed {
            self.inner.resource_subscriptions.write().remove(uri);
            self.signal(EngineSignal::ListChanged(ListKind::Resources));
        }
        removed
    }

    /// Registers or replaces a prompt.
    pub fn register_prompt(&self, prompt: Prompt) {
        self.inner.prompts.write().register(prompt);
        self.signal(EngineSignal::ListChanged(ListKind::Prompts));
    }

    /// Removes a prompt.
    pub fn unregister_prompt(&self, name: &str) -> bool {
        let removed = self.inner.prompts.write().unregister(name);
        if removed {
            self.signal(EngineSignal::ListChanged(ListKind::Prompts));
        }
        removed
    }
}

// ============================================================================
// ProtocolEngine - Outbound
// ============================================================================

impl ProtocolEngine {
    /// Queues a notification for delivery.
    pub fn notify(&self, target: Option<Origin>, notification: Notification) {
        self.signal(EngineSignal::Notification {
            target,
            notification,
        });
    }

    /// Records progress and emits `notifications/progress` to the requester.
    ///
    /// Returns `false` if no in-flight request of `origin` holds `token`.
    pub fn report_progress(
        &self,
        origin: Option<&Origin>,
        token: &ProgressToken,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> bool {
        if self
            .inner
            .tracker
            .record_progress(origin, token, progress, total, message.clone())
            .is_none()
        {
            return false;
        }

        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
            message,
        };
        self.notify(
            origin.cloned(),
            Notification::new("notifications/progress", serde_json::to_value(params).ok()),
        );
        true
    }

    /// Last progress reported under `token` by a request of `origin`.
    #[must_use]
    pub fn progress(&self, origin: Option<&Origin>, token: &ProgressToken) -> Option<ProgressSnapshot> {
        self.inner.tracker.progress(origin, token)
    }

    /// Emits `notifications/resources/updated` to every subscriber of `uri`.
    ///
    /// Returns the number of subscribers notified.
    pub fn notify_resource_updated(&self, uri: &str) -> usize {
        let targets: Vec<Option<Origin>> = self
            .inner
            .resource_subscriptions
            .read()
            .get(uri)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for target in &targets {
            self.notify(
                target.clone(),
                Notification::new("notifications/resources/updated", Some(json!({ "uri": uri }))),
            );
        }
        targets.len()
    }

    /// Emits `notifications/message` when `level` meets the threshold.
    pub fn log(&self, level: LogLevel, logger: Option<&str>, data: Value) -> bool {
        if level < self.log_level() {
            return false;
        }
        let params = LoggingMessageParams {
            level,
            logger: logger.map(str::to_string),
            data,
        };
        self.notify(
            None,
            Notification::new("notifications/message", serde_json::to_value(params).ok()),
        );
        true
    }

    /// Forgets a departed connection: cancels its in-flight requests and
    /// drops its resource subscriptions.
    pub fn remove_origin(&self, origin: &Origin) -> usize {
        let cancelled = self.inner.tracker.cancel_by_origin(origin);
        let key = Some(origin.clone());
        self.inner.resource_subscriptions.write().retain(|_, set| {
            set.remove(&key);
            !set.is_empty()
        });
        if cancelled > 0 {
            debug!(connection = %origin.connection, cancelled, "Cancelled requests of departed connection");
        }
        cancelled
    }
}

// ============================================================================
// Tests
// ============================================================================
