//! Transport layer.
//!
//! Moves serialized envelopes between the server and its clients over
//! several channels at once.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  WebSocket   │   │  SSE + POST  │   │     Pipe     │
//! │ (many conns) │   │ (many conns) │   │  (one conn)  │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │ ConnectionRegistry (per transport)  │
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!                  TransportManager ──► TransportEvent stream
//!                  (primary, failover, broadcast, replay)
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `base` | `Transport` trait, events, capabilities |
//! | `connection` | Per-transport connection table and stats |
//! | `manager` | Multi-transport routing |
//! | `websocket` | WebSocket server transport |
//! | `sse` | SSE push stream plus HTTP POST |
//! | `pipe` | Newline-delimited JSON over a byte stream |
//! | `rate_limit` | Per-connection sliding windows |

// ============================================================================
// Submodules
// ============================================================================

/// Transport trait and shared types.
pub mod base;

/// Per-transport connection table.
pub mod connection;

/// Multi-transport routing with failover.
pub mod manager;

/// Newline-delimited JSON transport.
pub mod pipe;

/// Sliding-window rate limiting.
pub mod rate_limit;

/// SSE + HTTP transport.
pub mod sse;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use base::{
    EventSink, Transport, TransportCapabilities, TransportEvent, TransportKind, TransportStats,
};
pub use connection::{ConnectionRegistry, ConnectionStats, Outbound};
pub use manager::{BroadcastReport, ReplayEntry, TransportManager, TransportManagerStats};
pub use pipe::PipeTransport;
pub use rate_limit::RateLimiter;
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;
