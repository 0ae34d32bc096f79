//! A real WebSocket client against a running server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use browser_mcp_server::config::TransportConfig;
use browser_mcp_server::{Server, ServerConfig, WebSocketTransport};

use common::{MockBackend, WAIT};

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("json");
        }
    }
}

async fn response_to(socket: &mut Socket, id: u64) -> Value {
    loop {
        let message = next_json(socket).await;
        if message["id"] == json!(id) {
            return message;
        }
    }
}

#[tokio::test]
async fn test_websocket_session() -> anyhow::Result<()> {
    common::init_tracing();

    let config = ServerConfig {
        transport: TransportConfig {
            websocket_addr: "127.0.0.1:0".parse()?,
            ..TransportConfig::default()
        },
        ..ServerConfig::default()
    };
    let websocket = Arc::new(WebSocketTransport::new(config.transport.clone()));
    let backend = MockBackend::new();
    let server = Server::builder()
        .config(config)
        .backend(backend.clone())
        .primary_transport(websocket.clone())
        .build()?;
    server.start().await?;

    let addr = websocket.local_addr().expect("bound address");
    let (mut socket, _) = connect_async(format!("ws://{addr}")).await?;

    let welcome = next_json(&mut socket).await;
    assert_eq!(welcome["method"], json!("notifications/welcome"));
    assert_eq!(welcome["params"]["transport"], json!("websocket"));

    let initialize = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "ws-client", "version": "0.1.0" },
        },
    });
    socket.send(Message::Text(initialize.to_string().into())).await?;
    let response = response_to(&mut socket, 1).await;
    assert!(response["result"]["capabilities"].is_object());

    let call = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": { "name": "version", "arguments": {} },
    });
    socket.send(Message::Text(call.to_string().into())).await?;
    let response = response_to(&mut socket, 2).await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap_or_default();
    assert!(text.contains("MockBrowser"));
    assert_eq!(backend.calls("version"), 1);

    socket.close(None).await?;
    let stats = server.transports().clone();
    timeout(Duration::from_secs(5), async {
        while stats.stats().transports.iter().any(|t| !t.connections.is_empty()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    server.shutdown().await;
    Ok(())
}
