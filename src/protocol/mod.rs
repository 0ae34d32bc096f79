//! JSON-RPC protocol layer.
//!
//! Envelopes, typed MCP params and results, the tool catalog, registries,
//! in-flight tracking and the [`ProtocolEngine`] that ties them together.
//!
//! # Message Types
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Client → Server | Method call expecting a response |
//! | `Response` | Server → Client | Result or error for one request |
//! | `Notification` | Both | One-way message, never answered |
//!
//! # Method Naming
//!
//! Methods follow `area/action` format:
//!
//! - `tools/call`
//! - `resources/read`
//! - `notifications/progress`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `request` | Envelopes and inbound classification |
//! | `types` | Typed method params and results |
//! | `command` | [`ToolCall`] tagged variants |
//! | `registry` | Tool, resource and prompt registries |
//! | `tracker` | In-flight request table |
//! | `engine` | [`ProtocolEngine`] |

// ============================================================================
// Submodules
// ============================================================================

/// Tool calls as tagged variants.
pub mod command;

/// Request dispatch and lifecycle.
pub mod engine;

/// Tool, resource and prompt registries.
pub mod registry;

/// Request, Response and Notification envelopes.
pub mod request;

/// In-flight request tracking.
pub mod tracker;

/// Typed method params and results.
pub mod types;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::ToolCall;
pub use engine::{
    CallContext, EngineSignal, EngineStats, ListKind, Origin, ProtocolEngine, RequestHandler,
};
pub use registry::{Prompt, PromptRegistry, ResourceRegistry, ToolRegistry};
pub use request::{
    Envelope, ErrorObject, Incoming, JsonRpcVersion, Message, Notification, Request, Response,
    ResponsePayload, parse_incoming,
};
pub use tracker::{ProgressSnapshot, RequestState, RequestTracker, TrackGuard};
pub use types::*;
