//! Tool and resource execution.
//!
//! [`ServerHandler`] is the bridge the protocol engine calls into. Each tool
//! call flows through the same steps:
//!
//! 1. Resolve the target page, defaulting to the most recent one
//! 2. Serve cacheable reads from the [`ResponseCache`]
//! 3. Otherwise execute through the pool's [`AutomationBackend`](crate::pool::AutomationBackend)
//! 4. Invalidate the page's cached reads after a mutating call
//! 5. Publish a `tool.completed` or `tool.failed` event

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;

use crate::cache::{PolicyTable, ResponseCache, SessionCache, fingerprint};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventCategory, EventSource, Severity, event_callback};
use crate::identifiers::ResourceId;
use crate::pool::{BrowserKind, MidOptions, ResourcePool, TopOptions};
use crate::protocol::{
    CallContext, CallToolResult, Notification, ReadResourceResult, RequestHandler,
    ResourceContents, ToolCall,
};

use super::catalog::{
    CACHE_STATS_URI, POOL_STATS_URI, RECENT_EVENTS_LIMIT, RECENT_EVENTS_URI, page_uri,
    parse_page_uri,
};

// ============================================================================
// Helpers
// ============================================================================

/// Cache tag shared by every cached read of one page.
#[must_use]
pub fn page_tag(page: &ResourceId) -> String {
    format!("page:{page}")
}

/// Drops every cached read of `page`.
pub(crate) fn invalidate_page(cache: &ResponseCache, page: &ResourceId) -> usize {
    cache.delete_by_tag(&page_tag(page))
}

/// Cache key of `call` with the resolved page folded into its arguments.
fn cache_key(call: &ToolCall, page: Option<&ResourceId>) -> String {
    let mut arguments = call.arguments();
    if let (Some(page), Some(map)) = (page, arguments.as_object_mut()) {
        map.insert("pageId".to_string(), Value::String(page.to_string()));
    }
    fingerprint(call.name(), &arguments)
}

fn check_url(url: &str) -> Result<()> {
    Url::parse(url)
        .map(|_| ())
        .map_err(|e| Error::invalid_params(format!("invalid url {url:?}: {e}")))
}

/// What one call produced, before it becomes a tool result.
struct Outcome {
    value: Value,
    page: Option<ResourceId>,
    cached: bool,
}

impl Outcome {
    fn fresh(value: Value) -> Self {
        Self {
            value,
            page: None,
            cached: false,
        }
    }
}

// ============================================================================
// ServerHandler
// ============================================================================

/// Executes tool calls and resource reads against the pool and caches.
pub struct ServerHandler {
    pool: ResourcePool,
    cache: Arc<ResponseCache>,
    sessions: Arc<SessionCache>,
    events: EventBus,
    policies: PolicyTable,
    cache_enabled: bool,
}

impl std::fmt::Debug for ServerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandler")
            .field("resources", &self.pool.len())
            .field("cached", &self.cache.len())
            .field("cache_enabled", &self.cache_enabled)
            .finish_non_exhaustive()
    }
}

impl ServerHandler {
    /// Creates a handler over shared components.
    #[must_use]
    pub fn new(
        pool: ResourcePool,
        cache: Arc<ResponseCache>,
        sessions: Arc<SessionCache>,
        events: EventBus,
        policies: PolicyTable,
        cache_enabled: bool,
    ) -> Self {
        Self {
            pool,
            cache,
            sessions,
            events,
            policies,
            cache_enabled,
        }
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Returns the explicit page after checking it, or the default page.
    ///
    /// The default page is the most recent page of the most recent context
    /// of a default browser; missing levels are created on the way.
    async fn resolve_page(&self, explicit: Option<&ResourceId>) -> Result<ResourceId> {
        if let Some(id) = explicit {
            self.pool.page(id)?;
            return Ok(id.clone());
        }
        let context = self.default_context().await?;
        self.pool.acquire_leaf(&context).await
    }

    async fn default_browser(&self) -> Result<ResourceId> {
        self.pool
            .acquire_top(BrowserKind::default(), &TopOptions::default())
            .await
    }

    async fn default_context(&self) -> Result<ResourceId> {
        let browser = self.default_browser().await?;
        match self.pool.latest_child(&browser) {
            Some(context) => Ok(context),
            None => self.pool.acquire_mid(&browser, &MidOptions::default()).await,
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn execute(&self, ctx: &CallContext, call: &ToolCall) -> Result<Outcome> {
        match call {
            ToolCall::LaunchBrowser { kind, options } => {
                let id = self.pool.acquire_top(*kind, options).await?;
                Ok(Outcome::fresh(json!({ "browserId": id, "kind": kind })))
            }
            ToolCall::NewContext {
                browser_id,
                options,
            } => {
                let browser = match browser_id {
                    Some(id) => id.clone(),
                    None => self.default_browser().await?,
                };
                let id = self.pool.acquire_mid(&browser, options).await?;
                Ok(Outcome::fresh(json!({ "contextId": id, "browserId": browser })))
            }
            ToolCall::NewPage { context_id } => {
                let context = match context_id {
                    Some(id) => id.clone(),
                    None => self.default_context().await?,
                };
                let id = self.pool.create_leaf(&context).await?;
                Ok(Outcome {
                    value: json!({ "pageId": id, "contextId": context }),
                    page: Some(id),
                    cached: false,
                })
            }
            ToolCall::CloseResource { resource_id } => {
                let closed = self.pool.close(resource_id).await?;
                for id in &closed {
                    invalidate_page(&self.cache, id);
                }
                Ok(Outcome::fresh(json!({ "closed": closed })))
            }

            ToolCall::Version {} => self.execute_cached(ctx, None, call).await,
            ToolCall::HttpRequest { url, .. } => {
                check_url(url)?;
                self.execute_cached(ctx, None, call).await
            }

            ToolCall::PoolStats {} => Ok(Outcome::fresh(serde_json::to_value(self.pool.stats())?)),
            ToolCall::CacheStats {} => Ok(Outcome::fresh(self.cache_stats()?)),
            ToolCall::QueryEvents { query } => Ok(Outcome::fresh(serde_json::to_value(
                self.events.query_events(query),
            )?)),

            ToolCall::SubscribeEvents { filter } => {
                let engine = ctx.engine().clone();
                let target = ctx.origin.clone();
                let owner = target.as_ref().map(|o| o.connection);
                let id = self.events.subscribe(
                    filter.clone(),
                    owner,
                    event_callback(move |record| {
                        let method = format!("notifications/browser/{}", record.category.as_str());
                        let params = serde_json::to_value(record)?;
                        engine.notify(target.clone(), Notification::new(method, Some(params)));
                        Ok(())
                    }),
                );
                Ok(Outcome::fresh(json!({ "subscriptionId": id })))
            }
            ToolCall::UnsubscribeEvents { subscription_id } => {
                let removed = self.events.unsubscribe(*subscription_id);
                Ok(Outcome::fresh(json!({ "removed": removed })))
            }

            ToolCall::SaveSession {
                session_id,
                state_type,
                state,
                page_id,
                persistent,
            } => {
                let (state, page) = match state {
                    Some(state) => (state.clone(), None),
                    None => {
                        let page = self.resolve_page(page_id.as_ref()).await?;
                        let capture = ToolCall::Cookies {
                            page_id: Some(page.clone()),
                            urls: None,
                        };
                        (self.run_backend(ctx, Some(&page), &capture).await?, Some(page))
                    }
                };
                self.sessions
                    .set(session_id, state_type, &state, *persistent)
                    .await?;
                Ok(Outcome {
                    value: json!({
                        "saved": true,
                        "sessionId": session_id,
                        "stateType": state_type,
                        "persistent": persistent,
                    }),
                    page,
                    cached: false,
                })
            }
            ToolCall::RestoreSession {
                session_id,
                state_type,
            } => {
                let state = self.sessions.get(session_id, state_type).await?;
                Ok(Outcome::fresh(json!({
                    "sessionId": session_id,
                    "stateType": state_type,
                    "found": state.is_some(),
                    "state": state,
                })))
            }

            _ => self.run_page_tool(ctx, call).await,
        }
    }

    async fn run_page_tool(&self, ctx: &CallContext, call: &ToolCall) -> Result<Outcome> {
        if let ToolCall::Navigate { url, .. } = call {
            check_url(url)?;
        }

        let page = self.resolve_page(call.page_id()).await?;
        let mut outcome = self.execute_cached(ctx, Some(&page), call).await?;

        if call.is_mutating() {
            let dropped = invalidate_page(&self.cache, &page);
            ctx.engine().notify_resource_updated(&page_uri(&page));
            trace!(page = %page, dropped, "Invalidated cached reads");
        }

        outcome.page = Some(page);
        Ok(outcome)
    }

    /// Serves `call` from the response cache when its policy allows.
    async fn execute_cached(
        &self,
        ctx: &CallContext,
        page: Option<&ResourceId>,
        call: &ToolCall,
    ) -> Result<Outcome> {
        let policy = if self.cache_enabled {
            self.policies.policy(call.name())
        } else {
            None
        };
        let Some(policy) = policy else {
            return Ok(Outcome::fresh(self.run_backend(ctx, page, call).await?));
        };

        let key = cache_key(call, page);
        if let Some(value) = self.cache.get(&key) {
            trace!(tool = call.name(), key = %key, "Cache hit");
            return Ok(Outcome {
                value,
                page: None,
                cached: true,
            });
        }

        let value = self.run_backend(ctx, page, call).await?;
        let mut tags = vec![format!("tool:{}", call.name())];
        if let Some(page) = page {
            tags.push(page_tag(page));
        }
        self.cache.set(&key, &value, Some(policy.ttl), &tags);
        Ok(Outcome::fresh(value))
    }

    async fn run_backend(
        &self,
        ctx: &CallContext,
        page: Option<&ResourceId>,
        call: &ToolCall,
    ) -> Result<Value> {
        ctx.progress(0.0, Some(1.0), Some(format!("running {}", call.name())));
        let value = self.pool.backend().execute(page, call).await?;
        if let Some(page) = page {
            self.pool.touch(page);
        }
        ctx.progress(1.0, Some(1.0), None);
        Ok(value)
    }

    fn cache_stats(&self) -> Result<Value> {
        Ok(json!({
            "response": serde_json::to_value(self.cache.stats())?,
            "session": serde_json::to_value(self.sessions.stats())?,
        }))
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn record_call(&self, ctx: &CallContext, name: &str, started: Instant, outcome: &Result<Outcome>) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let event = match outcome {
            Ok(outcome) => {
                let event = Event::new("tool.completed", EventCategory::Tool).with_data(json!({
                    "tool": name,
                    "requestId": ctx.request_id,
                    "durationMs": elapsed_ms,
                    "cached": outcome.cached,
                }));
                match &outcome.page {
                    Some(page) => event.with_source(EventSource::page(page.clone())),
                    None => event,
                }
            }
            Err(e) => Event::new("tool.failed", EventCategory::Tool)
                .with_severity(Severity::Error)
                .with_data(json!({
                    "tool": name,
                    "requestId": ctx.request_id,
                    "durationMs": elapsed_ms,
                    "code": e.code(),
                    "error": e.to_string(),
                })),
        };
        self.events.publish(event.with_tag(name));
    }
}

// ============================================================================
// RequestHandler impl
// ============================================================================

#[async_trait]
impl RequestHandler for ServerHandler {
    async fn call_tool(&self, ctx: &CallContext, call: ToolCall) -> Result<CallToolResult> {
        let name = call.name();
        let started = Instant::now();
        debug!(tool = name, request_id = %ctx.request_id, "Calling tool");

        let outcome = self.execute(ctx, &call).await;
        self.record_call(ctx, name, started, &outcome);

        outcome.map(|outcome| CallToolResult::json(&outcome.value))
    }

    async fn read_resource(&self, _ctx: &CallContext, uri: &str) -> Result<ReadResourceResult> {
        let value = match uri {
            POOL_STATS_URI => serde_json::to_value(self.pool.stats())?,
            CACHE_STATS_URI => self.cache_stats()?,
            RECENT_EVENTS_URI => {
                serde_json::to_value(self.events.get_recent_events(RECENT_EVENTS_LIMIT))?
            }
            _ => {
                let id = parse_page_uri(uri)
                    .ok_or_else(|| Error::invalid_params(format!("Unknown resource: {uri}")))?;
                let info = self
                    .pool
                    .get(&id)
                    .ok_or_else(|| Error::resource_not_found(id.clone()))?;
                json!({ "resource": info, "lineage": self.pool.lineage(&id) })
            }
        };

        Ok(ReadResourceResult {
            contents: vec![ResourceContents::json(uri, &value)],
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use crate::config::{
        CacheConfig, EventConfig, PoolConfig, ProtocolConfig, SessionCacheConfig,
    };
    use crate::pool::{AutomationBackend, ResourceLevel};
    use crate::protocol::{Implementation, ProtocolEngine};
    use crate::server::catalog;

    #[derive(Default)]
    struct MockBackend {
        next: AtomicU64,
        calls: Mutex<Vec<(Option<ResourceId>, &'static str)>>,
    }

    impl MockBackend {
        fn mint(&self, prefix: &str) -> ResourceId {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            ResourceId::new(format!("{prefix}-{n}"))
        }

        fn calls_of(&self, name: &str) -> usize {
            self.calls.lock().iter().filter(|(_, n)| *n == name).count()
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

        async fn is_connected(&self, _: &ResourceId) -> bool {
            true
        }

        async fn close(&self, _: &ResourceId, _: ResourceLevel) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, page: Option<&ResourceId>, call: &ToolCall) -> Result<Value> {
            self.calls.lock().push((page.cloned(), call.name()));
            match call {
                ToolCall::CurrentTitle { .. } => Ok(json!("Example Domain")),
                ToolCall::Cookies { .. } => Ok(json!([{ "name": "sid", "value": "abc" }])),
                ToolCall::Click { selector, .. } if selector == "#missing" => {
                    Err(Error::backend("element not found"))
                }
                _ => Ok(json!({ "ok": true })),
            }
        }
    }

    struct Fixture {
        engine: ProtocolEngine,
        backend: Arc<MockBackend>,
        pool: ResourcePool,
        cache: Arc<ResponseCache>,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::default());
        let pool = ResourcePool::new(PoolConfig::default(), backend.clone());
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
        let sessions = Arc::new(SessionCache::new(SessionCacheConfig::default()));
        let events = EventBus::new(EventConfig::default());

        let handler = ServerHandler::new(
            pool.clone(),
            cache.clone(),
            sessions,
            events.clone(),
            PolicyTable::default(),
            true,
        );
        let engine = ProtocolEngine::new(
            ProtocolConfig::default(),
            Implementation {
                name: "test".to_string(),
                version: "0.0.0".to_string(),
            },
            Arc::new(handler),
        );
        catalog::install(&engine);

        engine
            .handle_message(
                r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
                None,
            )
            .await
            .expect("initialize response");

        Fixture {
            engine,
            backend,
            pool,
            cache,
            events,
        }
    }

    async fn call(engine: &ProtocolEngine, name: &str, arguments: Value) -> Value {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        });
        let text = engine
            .handle_message(&request.to_string(), None)
            .await
            .expect("response");
        serde_json::from_str(&text).expect("json")
    }

    fn result_json(response: &Value) -> Value {
        let text = response["result"]["content"][0]["text"]
            .as_str()
            .expect("text content");
        serde_json::from_str(text).expect("json text")
    }

    #[tokio::test]
    async fn test_default_page_created_and_reused() {
        let f = fixture().await;

        call(&f.engine, "current-url", json!({})).await;
        call(&f.engine, "navigate", json!({ "url": "https://example.com" })).await;

        let stats = f.pool.stats();
        assert_eq!(stats.browsers, 1);
        assert_eq!(stats.contexts, 1);
        assert_eq!(stats.pages, 1);

        let calls = f.backend.calls.lock();
        assert_eq!(calls[0].0, calls[1].0);
    }

    #[tokio::test]
    async fn test_cacheable_read_hits_cache() {
        let f = fixture().await;

        let first = call(&f.engine, "current-title", json!({})).await;
        let second = call(&f.engine, "current-title", json!({})).await;

        assert_eq!(result_json(&first), json!("Example Domain"));
        assert_eq!(result_json(&second), json!("Example Domain"));
        assert_eq!(f.backend.calls_of("current-title"), 1);
        assert_eq!(f.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_mutating_call_invalidates_page_reads() {
        let f = fixture().await;

        call(&f.engine, "current-title", json!({})).await;
        call(&f.engine, "click", json!({ "selector": "#go" })).await;
        call(&f.engine, "current-title", json!({})).await;

        assert_eq!(f.backend.calls_of("current-title"), 2);
    }

    #[tokio::test]
    async fn test_unknown_page_is_error_result() {
        let f = fixture().await;

        let response = call(&f.engine, "current-url", json!({ "pageId": "page-404" })).await;
        assert_eq!(response["result"]["isError"], json!(true));
        assert_eq!(f.backend.calls_of("current-url"), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_publishes_event() {
        let f = fixture().await;

        let response = call(&f.engine, "click", json!({ "selector": "#missing" })).await;
        assert_eq!(response["result"]["isError"], json!(true));

        let failed = f.events.get_events_by_type("tool.failed", 10);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data["tool"], json!("click"));
        assert_eq!(failed[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_invalid_navigate_url_rejected() {
        let f = fixture().await;

        let response = call(&f.engine, "navigate", json!({ "url": "not a url" })).await;
        assert_eq!(response["error"]["code"], json!(-32602));
        assert_eq!(f.backend.calls_of("navigate"), 0);
    }

    #[tokio::test]
    async fn test_close_cascades_and_drops_cache() {
        let f = fixture().await;

        let launched = result_json(&call(&f.engine, "launch-browser", json!({})).await);
        let browser = launched["browserId"].as_str().expect("id").to_string();
        let context = result_json(
            &call(&f.engine, "new-context", json!({ "browserId": browser })).await,
        );
        let context = context["contextId"].as_str().expect("id").to_string();
        let page = result_json(&call(&f.engine, "new-page", json!({ "contextId": context })).await);
        let page = page["pageId"].as_str().expect("id").to_string();

        call(&f.engine, "current-title", json!({ "pageId": page })).await;
        assert_eq!(f.cache.len(), 1);

        let closed = result_json(&call(&f.engine, "close-resource", json!({ "resourceId": browser })).await);
        assert_eq!(closed["closed"].as_array().map(Vec::len), Some(3));
        assert!(f.pool.is_empty());
        assert_eq!(f.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_save_session_captures_cookies() {
        let f = fixture().await;

        call(&f.engine, "save-session", json!({ "sessionId": "s1" })).await;
        let restored = result_json(
            &call(&f.engine, "restore-session", json!({ "sessionId": "s1" })).await,
        );

        assert_eq!(restored["found"], json!(true));
        assert_eq!(restored["state"][0]["name"], json!("sid"));
        assert_eq!(f.backend.calls_of("cookies"), 1);
    }

    #[tokio::test]
    async fn test_subscription_relays_events() {
        let f = fixture().await;
        let mut signals = f.engine.subscribe();

        let subscribed = result_json(
            &call(&f.engine, "subscribe-events", json!({ "filter": { "categories": ["tool"] } })).await,
        );
        assert!(subscribed["subscriptionId"].is_string());

        call(&f.engine, "version", json!({})).await;

        let mut relayed = None;
        while let Ok(signal) = signals.try_recv() {
            if let crate::protocol::EngineSignal::Notification { notification, .. } = signal
                && notification.method == "notifications/browser/tool"
            {
                relayed = Some(notification);
            }
        }
        let relayed = relayed.expect("relayed event");
        assert_eq!(relayed.params.expect("params")["data"]["tool"], json!("version"));
    }

    #[tokio::test]
    async fn test_read_page_resource() {
        let f = fixture().await;
        call(&f.engine, "current-url", json!({})).await;
        let page = f.pool.list(Some(ResourceLevel::Leaf))[0].id.clone();

        let request = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "resources/read",
            "params": { "uri": page_uri(&page) },
        });
        let text = f
            .engine
            .handle_message(&request.to_string(), None)
            .await
            .expect("response");
        let response: Value = serde_json::from_str(&text).expect("json");
        let body: Value = serde_json::from_str(
            response["result"]["contents"][0]["text"].as_str().expect("text"),
        )
        .expect("json text");
        assert_eq!(body["lineage"].as_array().map(Vec::len), Some(3));
    }
}
