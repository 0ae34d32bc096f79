//! Browser MCP Server - Protocol and session orchestration for remote automation.
//!
//! This library is the server core of a remote browser-automation service
//! speaking JSON-RPC 2.0 with MCP methods. It accepts clients over several
//! transports, tracks every request for cancellation and timeout, multiplexes
//! tool calls onto a pool of browser resources, and layers caching and an
//! event bus on top.
//!
//! # Architecture
//!
//! ```text
//!  WebSocket   SSE + POST   Pipe
//!      └──────────┼──────────┘
//!          TransportManager ◄────────────── notifications, events
//!                 │                                  ▲
//!            RateLimiter                             │
//!                 ▼                                  │
//!          ProtocolEngine ──► ServerHandler ──► ResponseCache
//!      (handshake, tracking,        │                │ miss
//!        timeout, batching)         ▼                ▼
//!                              ResourcePool ──► AutomationBackend
//!                                   │
//!                                   ▼
//!                               EventBus
//! ```
//!
//! Key design principles:
//!
//! - The automation engine itself is external, behind [`AutomationBackend`]
//! - Tool calls are typed [`ToolCall`] variants, validated at the boundary
//! - Every component is a cheap-to-clone handle over shared state
//! - Background work runs on owned [`PeriodicTask`]s stopped at shutdown
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use browser_mcp_server::{AutomationBackend, Result, Server};
//!
//! # async fn example(backend: Arc<dyn AutomationBackend>) -> Result<()> {
//! let server = Server::builder()
//!     .backend(backend)
//!     .websocket()
//!     .sse()
//!     .build()?;
//!
//! server.start().await?;
//! tokio::signal::ctrl_c().await?;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Response cache and session-state cache |
//! | [`config`] | [`ServerConfig`] and per-component sections |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | Filtered publish/subscribe with history |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`periodic`] | Cancellable recurring tasks |
//! | [`pool`] | Three-level resource pool |
//! | [`protocol`] | JSON-RPC envelopes and the [`ProtocolEngine`] |
//! | [`server`] | [`Server`] assembly and relays |
//! | [`transport`] | WebSocket, SSE and pipe transports |

// ============================================================================
// Modules
// ============================================================================

/// Response cache and session-state cache.
pub mod cache;

/// Server configuration.
///
/// Every section has defaults and loads from JSON.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Event bus with filtering, history and subscriptions.
pub mod events;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Owned recurring background tasks.
pub mod periodic;

/// Three-level resource pool over an external backend.
pub mod pool;

/// JSON-RPC protocol engine.
pub mod protocol;

/// Server orchestration.
///
/// Use [`Server::builder()`] to create a configured server.
pub mod server;

/// Transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Server types
pub use server::{Server, ServerBuilder, ServerHandler, ServerStats};

// Configuration
pub use config::ServerConfig;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{
    ConnectionId, EventId, ProgressToken, RequestId, ResourceId, SubscriptionId,
};

// Component types
pub use cache::{PolicyTable, ResponseCache, SessionCache};
pub use events::{Event, EventBus, EventCategory, EventFilter, EventRecord, Severity};
pub use periodic::PeriodicTask;
pub use pool::{AutomationBackend, BrowserKind, ResourceLevel, ResourcePool};
pub use protocol::{Origin, ProtocolEngine, RequestHandler, ToolCall};
pub use transport::{
    PipeTransport, SseTransport, Transport, TransportEvent, TransportManager, WebSocketTransport,
};
