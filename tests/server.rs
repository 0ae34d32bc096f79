//! End-to-end behaviour of a running server over loopback transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::assert_ok;

use browser_mcp_server::config::RateLimitConfig;
use browser_mcp_server::protocol::ToolDefinition;
use browser_mcp_server::{EventCategory, Server, ServerConfig, Transport};

use common::{LoopbackTransport, MockBackend, eventually, tool_json};

fn server_with(
    config: ServerConfig,
    backend: Arc<MockBackend>,
    transports: &[Arc<LoopbackTransport>],
) -> Server {
    common::init_tracing();
    let mut builder = Server::builder().config(config).backend(backend);
    for transport in transports {
        builder = builder.transport(transport.clone());
    }
    builder.build().expect("build server")
}

#[tokio::test]
async fn test_welcome_then_handshake() {
    let loopback = LoopbackTransport::new("loop");
    let server = server_with(ServerConfig::default(), MockBackend::new(), &[loopback.clone()]);
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    let welcome = client.notification("notifications/welcome").await;
    assert_eq!(welcome["params"]["connectionId"], json!(client.id));
    assert_eq!(welcome["params"]["transport"], json!("loop"));

    let response = client.initialize().await;
    assert_eq!(response["result"]["protocolVersion"], json!("2024-11-05"));
    assert_eq!(
        response["result"]["serverInfo"]["name"],
        json!(server.config().server.name)
    );

    let tools = client.request(1, "tools/list", json!({})).await;
    assert_eq!(tools["result"]["tools"].as_array().map(Vec::len), Some(22));

    server.shutdown().await;
}

#[tokio::test]
async fn test_repeated_title_read_served_from_cache() {
    let loopback = LoopbackTransport::new("loop");
    let backend = MockBackend::new();
    let server = server_with(ServerConfig::default(), backend.clone(), &[loopback.clone()]);
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    client.initialize().await;

    let first = client.call_tool(1, "current-title", json!({})).await;
    let second = client.call_tool(2, "current-title", json!({})).await;

    assert_eq!(tool_json(&first), tool_json(&second));
    assert_eq!(backend.calls("current-title"), 1);
    assert_eq!(server.cache().stats().hits, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_request_is_never_answered() {
    let loopback = LoopbackTransport::new("loop");
    let server = server_with(ServerConfig::default(), MockBackend::new(), &[loopback.clone()]);
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    client.initialize().await;

    client.send_json(&json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "tools/call",
        "params": { "name": "evaluate", "arguments": { "script": "sleep:300" } },
    }));
    let engine = server.engine().clone();
    eventually(|| engine.stats().in_flight == 1).await;

    client.send_json(&json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": { "requestId": 5, "reason": "user abort" },
    }));

    let events = server.events().clone();
    eventually(|| !events.get_events_by_type("request.cancelled", 1).is_empty()).await;

    // Let the stalled backend call finish; its result must be discarded.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let answered = client.drain().into_iter().any(|m| m["id"] == json!(5));
    assert!(!answered);
    assert_eq!(server.engine().stats().cancelled, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_slow_request_times_out() {
    let loopback = LoopbackTransport::new("loop");
    let server = Server::builder()
        .backend(MockBackend::new())
        .transport(loopback.clone())
        .request_timeout(Duration::from_millis(100))
        .build()
        .expect("build");
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    client.initialize().await;

    let response = client
        .call_tool(3, "evaluate", json!({ "script": "sleep:2000" }))
        .await;
    assert_eq!(response["error"]["code"], json!(-32001));

    let events = server.events().clone();
    eventually(|| !events.get_events_by_type("request.timeout", 1).is_empty()).await;
    assert_eq!(server.engine().stats().timed_out, 1);
    assert_eq!(server.engine().stats().in_flight, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_survives_failing_transport() {
    let a = LoopbackTransport::new("a");
    let b = LoopbackTransport::new("b");
    let c = LoopbackTransport::new("c");
    let server = server_with(
        ServerConfig::default(),
        MockBackend::new(),
        &[a.clone(), b.clone(), c.clone()],
    );
    assert_ok!(server.start().await);

    let mut client_a = a.connect();
    let _client_b = b.connect();
    let mut client_c = c.connect();
    client_a.notification("notifications/welcome").await;
    client_c.notification("notifications/welcome").await;
    b.set_failing(true);

    server.engine().register_tool(ToolDefinition {
        name: "extra".to_string(),
        description: "Added at runtime".to_string(),
        input_schema: json!({ "type": "object" }),
    });

    client_a.notification("notifications/tools/list_changed").await;
    client_c.notification("notifications/tools/list_changed").await;

    let report = server.transports().broadcast("{}").await;
    assert_eq!(report.delivered, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "b");

    server.shutdown().await;
}

#[tokio::test]
async fn test_closing_browser_cascades() {
    let loopback = LoopbackTransport::new("loop");
    let server = server_with(ServerConfig::default(), MockBackend::new(), &[loopback.clone()]);
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    client.initialize().await;

    let browser = tool_json(&client.call_tool(1, "launch-browser", json!({ "kind": "firefox" })).await);
    let browser = browser["browserId"].clone();
    let context = tool_json(&client.call_tool(2, "new-context", json!({ "browserId": browser })).await);
    let context = context["contextId"].clone();
    client.call_tool(3, "new-page", json!({ "contextId": context })).await;
    client.call_tool(4, "new-page", json!({ "contextId": context })).await;
    assert_eq!(server.pool().len(), 4);

    let closed = tool_json(&client.call_tool(5, "close-resource", json!({ "resourceId": browser })).await);
    assert_eq!(closed["closed"].as_array().map(Vec::len), Some(4));
    assert!(server.pool().is_empty());

    let events = server.events().clone();
    eventually(|| {
        events.get_events_by_type("page.closed", 10).len() == 2
            && events.get_events_by_type("browser.closed", 10).len() == 1
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_event_subscription_relay_and_cleanup() {
    let loopback = LoopbackTransport::new("loop");
    let server = server_with(ServerConfig::default(), MockBackend::new(), &[loopback.clone()]);
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    client.initialize().await;

    let subscribed = client
        .call_tool(1, "subscribe-events", json!({ "filter": { "categories": ["lifecycle"] } }))
        .await;
    assert!(tool_json(&subscribed)["subscriptionId"].is_string());
    assert_eq!(server.events().subscription_count(), 1);

    client.call_tool(2, "new-page", json!({})).await;
    let relayed = client.notification("notifications/browser/lifecycle").await;
    assert_eq!(relayed["params"]["category"], json!(EventCategory::Lifecycle.as_str()));

    client.disconnect();
    let events = server.events().clone();
    eventually(|| events.subscription_count() == 0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_rejects_excess_requests() {
    let config = ServerConfig {
        rate_limit: RateLimitConfig {
            enabled: true,
            per_minute: 2,
            per_hour: 100,
        },
        ..ServerConfig::default()
    };
    let loopback = LoopbackTransport::new("loop");
    let server = server_with(config, MockBackend::new(), &[loopback.clone()]);
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    client.initialize().await;
    let ok = client.request(1, "ping", json!({})).await;
    assert!(ok.get("result").is_some());

    let limited = client.request(2, "ping", json!({})).await;
    assert_eq!(limited["error"]["code"], json!(-32000));
    assert!(limited["error"]["data"]["retryAfterMs"].as_u64().is_some_and(|ms| ms > 0));

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_pool_and_transports() {
    let loopback = LoopbackTransport::new("loop");
    let server = server_with(ServerConfig::default(), MockBackend::new(), &[loopback.clone()]);
    assert_ok!(server.start().await);

    let mut client = loopback.connect();
    client.initialize().await;
    client.call_tool(1, "new-page", json!({})).await;
    assert_eq!(server.pool().len(), 3);

    server.shutdown().await;
    assert!(server.pool().is_empty());
    assert!(!loopback.is_connected());
}
