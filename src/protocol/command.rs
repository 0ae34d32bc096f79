//! Tool calls as tagged variants.
//!
//! Every tool the server offers is one [`ToolCall`] variant. Arguments are
//! checked against the variant's payload type at the protocol boundary, so
//! handlers never see loosely typed input.
//!
//! # Tool Groups
//!
//! | Group | Tools |
//! |-------|-------|
//! | Lifecycle | `launch-browser`, `new-context`, `new-page`, `close-resource` |
//! | Page actions | `navigate`, `click`, `fill`, `screenshot`, `evaluate` |
//! | Page reads | `current-url`, `current-title`, `page-content`, `cookies` |
//! | Engine | `version`, `http-request` |
//! | Introspection | `pool-stats`, `cache-stats`, `query-events` |
//! | Subscriptions | `subscribe-events`, `unsubscribe-events` |
//! | Sessions | `save-session`, `restore-session` |

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::events::{EventFilter, EventQuery};
use crate::identifiers::{ResourceId, SubscriptionId};
use crate::pool::{BrowserKind, MidOptions, TopOptions};

use super::types::ToolDefinition;

// ============================================================================
// ToolCall
// ============================================================================

/// A validated tool invocation.
///
/// Serialized form is `{ "name": "<tool>", "arguments": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all_fields = "camelCase")]
pub enum ToolCall {
    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// Acquire a browser of the given kind.
    #[serde(rename = "launch-browser")]
    LaunchBrowser {
        /// Engine family.
        #[serde(default)]
        kind: BrowserKind,
        /// Launch options.
        #[serde(default)]
        options: TopOptions,
    },

    /// Create an isolated context.
    #[serde(rename = "new-context")]
    NewContext {
        /// Owning browser; the default browser when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        browser_id: Option<ResourceId>,
        /// Context options.
        #[serde(default)]
        options: MidOptions,
    },

    /// Open a page.
    #[serde(rename = "new-page")]
    NewPage {
        /// Owning context; the default context when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_id: Option<ResourceId>,
    },

    /// Close a browser, context or page and everything it owns.
    #[serde(rename = "close-resource")]
    CloseResource {
        /// Resource to close.
        resource_id: ResourceId,
    },

    // ========================================================================
    // Page actions
    // ========================================================================
    /// Navigate a page.
    #[serde(rename = "navigate")]
    Navigate {
        /// Target page; the default page when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
        /// Destination URL.
        url: String,
        /// Load state to wait for.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_until: Option<String>,
    },

    /// Click an element.
    #[serde(rename = "click")]
    Click {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
        /// CSS selector.
        selector: String,
    },

    /// Fill an input.
    #[serde(rename = "fill")]
    Fill {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
        /// CSS selector.
        selector: String,
        /// Text to enter.
        value: String,
    },

    /// Capture a screenshot.
    #[serde(rename = "screenshot")]
    Screenshot {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
        /// Capture the full scrollable page.
        #[serde(default)]
        full_page: bool,
    },

    /// Evaluate script in the page.
    #[serde(rename = "evaluate")]
    Evaluate {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
        /// Script source.
        script: String,
    },

    // ========================================================================
    // Page reads
    // ========================================================================
    /// Current URL of a page.
    #[serde(rename = "current-url")]
    CurrentUrl {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
    },

    /// Current title of a page.
    #[serde(rename = "current-title")]
    CurrentTitle {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
    },

    /// Serialized DOM of a page.
    #[serde(rename = "page-content")]
    PageContent {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
    },

    /// Cookies visible to a page.
    #[serde(rename = "cookies")]
    Cookies {
        /// Target page.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
        /// Restrict to these URLs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        urls: Option<Vec<String>>,
    },

    // ========================================================================
    // Engine
    // ========================================================================
    /// Engine version string.
    #[serde(rename = "version")]
    Version {},

    /// HTTP request issued from the engine's network stack.
    #[serde(rename = "http-request")]
    HttpRequest {
        /// Request URL.
        url: String,
        /// HTTP method.
        #[serde(default = "default_http_method")]
        method: String,
        /// Request headers.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        /// Request body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Per-request timeout in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    // ========================================================================
    // Introspection
    // ========================================================================
    /// Pool occupancy.
    #[serde(rename = "pool-stats")]
    PoolStats {},

    /// Cache counters.
    #[serde(rename = "cache-stats")]
    CacheStats {},

    /// Query event history.
    #[serde(rename = "query-events")]
    QueryEvents {
        /// Filter and limit.
        #[serde(flatten)]
        query: EventQuery,
    },

    // ========================================================================
    // Subscriptions
    // ========================================================================
    /// Stream matching events to the calling connection.
    #[serde(rename = "subscribe-events")]
    SubscribeEvents {
        /// Which events to deliver.
        #[serde(default)]
        filter: EventFilter,
    },

    /// Stop a subscription.
    #[serde(rename = "unsubscribe-events")]
    UnsubscribeEvents {
        /// Subscription to remove.
        subscription_id: SubscriptionId,
    },

    // ========================================================================
    // Sessions
    // ========================================================================
    /// Store session state. Captures the page's cookies when `state` is
    /// omitted.
    #[serde(rename = "save-session")]
    SaveSession {
        /// Session key.
        session_id: String,
        /// Kind of state.
        #[serde(default = "default_state_type")]
        state_type: String,
        /// Explicit state to store.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<Value>,
        /// Page to capture from.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<ResourceId>,
        /// Mirror to durable storage.
        #[serde(default)]
        persistent: bool,
    },

    /// Load stored session state.
    #[serde(rename = "restore-session")]
    RestoreSession {
        /// Session key.
        session_id: String,
        /// Kind of state.
        #[serde(default = "default_state_type")]
        state_type: String,
    },
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_state_type() -> String {
    "cookies".to_string()
}

// ============================================================================
// ToolCall - Construction
// ============================================================================

impl ToolCall {
    /// Builds a call from a tool name and raw arguments.
    ///
    /// Missing or `null` arguments are treated as `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] for an unknown tool or arguments that
    /// do not fit the tool's payload.
    pub fn from_params(name: &str, arguments: Option<Value>) -> Result<Self> {
        let arguments = match arguments {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(args @ Value::Object(_)) => args,
            Some(_) => {
                return Err(Error::invalid_params(format!(
                    "arguments for {name} must be an object"
                )));
            }
        };

        serde_json::from_value(json!({ "name": name, "arguments": arguments }))
            .map_err(|e| Error::invalid_params(format!("{name}: {e}")))
    }

    /// Normalized arguments object, defaults filled in.
    #[must_use]
    pub fn arguments(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("arguments").map(Value::take))
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

// ============================================================================
// ToolCall - Classification
// ============================================================================

impl ToolCall {
    /// Tool name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LaunchBrowser { .. } => "launch-browser",
            Self::NewContext { .. } => "new-context",
            Self::NewPage { .. } => "new-page",
            Self::CloseResource { .. } => "close-resource",
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Fill { .. } => "fill",
            Self::Screenshot { .. } => "screenshot",
            Self::Evaluate { .. } => "evaluate",
            Self::CurrentUrl { .. } => "current-url",
            Self::CurrentTitle { .. } => "current-title",
            Self::PageContent { .. } => "page-content",
            Self::Cookies { .. } => "cookies",
            Self::Version {} => "version",
            Self::HttpRequest { .. } => "http-request",
            Self::PoolStats {} => "pool-stats",
            Self::CacheStats {} => "cache-stats",
            Self::QueryEvents { .. } => "query-events",
            Self::SubscribeEvents { .. } => "subscribe-events",
            Self::UnsubscribeEvents { .. } => "unsubscribe-events",
            Self::SaveSession { .. } => "save-session",
            Self::RestoreSession { .. } => "restore-session",
        }
    }

    /// Explicit target page, if the call names one.
    #[must_use]
    pub fn page_id(&self) -> Option<&ResourceId> {
        match self {
            Self::Navigate { page_id, .. }
            | Self::Click { page_id, .. }
            | Self::Fill { page_id, .. }
            | Self::Screenshot { page_id, .. }
            | Self::Evaluate { page_id, .. }
            | Self::CurrentUrl { page_id }
            | Self::CurrentTitle { page_id }
            | Self::PageContent { page_id }
            | Self::Cookies { page_id, .. }
            | Self::SaveSession { page_id, .. } => page_id.as_ref(),
            _ => None,
        }
    }

    /// Returns `true` if the call runs against a page on the backend.
    #[must_use]
    pub const fn targets_page(&self) -> bool {
        matches!(
            self,
            Self::Navigate { .. }
                | Self::Click { .. }
                | Self::Fill { .. }
                | Self::Screenshot { .. }
                | Self::Evaluate { .. }
                | Self::CurrentUrl { .. }
                | Self::CurrentTitle { .. }
                | Self::PageContent { .. }
                | Self::Cookies { .. }
        )
    }

    /// Returns `true` if the call can change page state, invalidating cached
    /// reads of that page.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Navigate { .. } | Self::Click { .. } | Self::Fill { .. } | Self::Evaluate { .. }
        )
    }
}

// ============================================================================
// Tool definitions
// ============================================================================

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn page_id_prop() -> Value {
    json!({ "type": "string", "description": "Target page id; defaults to the most recent page" })
}

fn tool(name: &str, description: &str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

impl ToolCall {
    /// Definitions of every built-in tool, as advertised by `tools/list`.
    #[must_use]
    pub fn definitions() -> Vec<ToolDefinition> {
        let kinds = json!({ "type": "string", "enum": ["chromium", "firefox", "webkit"] });
        let page = page_id_prop();

        vec![
            tool(
                "launch-browser",
                "Acquire a browser, reusing a healthy one of the same kind",
                schema(json!({ "kind": kinds, "options": { "type": "object" } }), &[]),
            ),
            tool(
                "new-context",
                "Create an isolated browser context",
                schema(
                    json!({ "browserId": { "type": "string" }, "options": { "type": "object" } }),
                    &[],
                ),
            ),
            tool(
                "new-page",
                "Open a new page in a context",
                schema(json!({ "contextId": { "type": "string" } }), &[]),
            ),
            tool(
                "close-resource",
                "Close a browser, context or page and everything it owns",
                schema(json!({ "resourceId": { "type": "string" } }), &["resourceId"]),
            ),
            tool(
                "navigate",
                "Navigate a page to a URL",
                schema(
                    json!({ "pageId": page, "url": { "type": "string" }, "waitUntil": { "type": "string" } }),
                    &["url"],
                ),
            ),
            tool(
                "click",
                "Click the element matching a selector",
                schema(json!({ "pageId": page, "selector": { "type": "string" } }), &["selector"]),
            ),
            tool(
                "fill",
                "Fill the input matching a selector",
                schema(
                    json!({ "pageId": page, "selector": { "type": "string" }, "value": { "type": "string" } }),
                    &["selector", "value"],
                ),
            ),
            tool(
                "screenshot",
                "Capture a PNG screenshot",
                schema(json!({ "pageId": page, "fullPage": { "type": "boolean" } }), &[]),
            ),
            tool(
                "evaluate",
                "Evaluate a script in the page and return its result",
                schema(json!({ "pageId": page, "script": { "type": "string" } }), &["script"]),
            ),
            tool(
                "current-url",
                "Current URL of a page",
                schema(json!({ "pageId": page }), &[]),
            ),
            tool(
                "current-title",
                "Current title of a page",
                schema(json!({ "pageId": page }), &[]),
            ),
            tool(
                "page-content",
                "Serialized HTML of a page",
                schema(json!({ "pageId": page }), &[]),
            ),
            tool(
                "cookies",
                "Cookies visible to a page",
                schema(
                    json!({ "pageId": page, "urls": { "type": "array", "items": { "type": "string" } } }),
                    &[],
                ),
            ),
            tool("version", "Browser engine version", schema(json!({}), &[])),
            tool(
                "http-request",
                "Issue an HTTP request from the browser's network stack",
                schema(
                    json!({
                        "url": { "type": "string" },
                        "method": { "type": "string" },
                        "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                        "body": { "type": "string" },
                        "timeoutMs": { "type": "integer", "minimum": 0 }
                    }),
                    &["url"],
                ),
            ),
            tool("pool-stats", "Resource pool occupancy", schema(json!({}), &[])),
            tool("cache-stats", "Response and session cache counters", schema(json!({}), &[])),
            tool(
                "query-events",
                "Query recorded browser and server events",
                schema(
                    json!({
                        "types": { "type": "array", "items": { "type": "string" } },
                        "categories": { "type": "array", "items": { "type": "string" } },
                        "severities": { "type": "array", "items": { "type": "string" } },
                        "pageId": { "type": "string" },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "since": { "type": "string", "format": "date-time" },
                        "until": { "type": "string", "format": "date-time" },
                        "limit": { "type": "integer", "minimum": 1 }
                    }),
                    &[],
                ),
            ),
            tool(
                "subscribe-events",
                "Receive matching events as notifications on this connection",
                schema(json!({ "filter": { "type": "object" } }), &[]),
            ),
            tool(
                "unsubscribe-events",
                "Cancel an event subscription",
                schema(json!({ "subscriptionId": { "type": "string" } }), &["subscriptionId"]),
            ),
            tool(
                "save-session",
                "Store session state, capturing page cookies when no state is given",
                schema(
                    json!({
                        "sessionId": { "type": "string" },
                        "stateType": { "type": "string" },
                        "state": {},
                        "pageId": page,
                        "persistent": { "type": "boolean" }
                    }),
                    &["sessionId"],
                ),
            ),
            tool(
                "restore-session",
                "Load stored session state",
                schema(
                    json!({ "sessionId": { "type": "string" }, "stateType": { "type": "string" } }),
                    &["sessionId"],
                ),
            ),
        ]
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::events::Severity;

    #[test]
    fn test_from_params_variants() {
        let call = ToolCall::from_params("current-title", Some(json!({ "pageId": "abc" }))).expect("parse");
        assert_eq!(
            call,
            ToolCall::CurrentTitle {
                page_id: Some("abc".into())
            }
        );
        assert_eq!(call.name(), "current-title");
        assert_eq!(call.page_id(), Some(&ResourceId::from("abc")));
        assert!(call.targets_page());
        assert!(!call.is_mutating());
    }

    #[test]
    fn test_zero_argument_tools_accept_missing_arguments() {
        assert_eq!(ToolCall::from_params("version", None).expect("parse"), ToolCall::Version {});
        assert_eq!(
            ToolCall::from_params("pool-stats", Some(Value::Null)).expect("parse"),
            ToolCall::PoolStats {}
        );
    }

    #[test]
    fn test_schema_rejections() {
        assert!(matches!(
            ToolCall::from_params("navigate", Some(json!({ "pageId": "p" }))),
            Err(Error::InvalidParams { .. })
        ));
        assert!(matches!(
            ToolCall::from_params("teleport", None),
            Err(Error::InvalidParams { .. })
        ));
        assert!(matches!(
            ToolCall::from_params("click", Some(json!(["#a"]))),
            Err(Error::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_defaults_fill_in() {
        let call = ToolCall::from_params("http-request", Some(json!({ "url": "https://example.com" })))
            .expect("parse");
        assert_eq!(call.arguments()["method"], "GET");

        let call = ToolCall::from_params("restore-session", Some(json!({ "sessionId": "s1" })))
            .expect("parse");
        assert_eq!(call.arguments()["stateType"], "cookies");
    }

    #[test]
    fn test_query_events_flattened() {
        let call = ToolCall::from_params(
            "query-events",
            Some(json!({ "types": ["network"], "severities": ["error"], "limit": 5 })),
        )
        .expect("parse");
        let ToolCall::QueryEvents { query } = call else {
            panic!("expected query-events");
        };
        assert_eq!(query.limit, 5);
        assert_eq!(query.filter.severities, Some(vec![Severity::Error]));
    }

    #[test]
    fn test_arguments_are_order_normalized() {
        let a = ToolCall::from_params("fill", Some(json!({ "selector": "#q", "value": "x", "pageId": "p" })))
            .expect("parse");
        let b = ToolCall::from_params("fill", Some(json!({ "pageId": "p", "value": "x", "selector": "#q" })))
            .expect("parse");
        assert_eq!(a.arguments(), b.arguments());
        assert!(a.is_mutating());
    }

    #[test]
    fn test_definitions_cover_every_tool() {
        let defs = ToolCall::definitions();
        assert_eq!(defs.len(), 22);
        for def in &defs {
            assert_eq!(def.input_schema["type"], "object", "{}", def.name);
        }
        assert!(defs.iter().any(|d| d.name == "current-title"));
    }
}
