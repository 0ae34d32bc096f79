//! Server orchestration.
//!
//! Wires the protocol engine, transports, resource pool, caches and event
//! bus into one running [`Server`].
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Server`] | Owns every component and the relay tasks |
//! | [`ServerBuilder`] | Fluent configuration builder |
//! | [`ServerHandler`] | Tool and resource execution behind the engine |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use browser_mcp_server::{AutomationBackend, Result, Server};
//!
//! # async fn example(backend: Arc<dyn AutomationBackend>) -> Result<()> {
//! let server = Server::builder().backend(backend).stdio().build()?;
//! server.start().await?;
//! tokio::signal::ctrl_c().await?;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder for server configuration.
pub mod builder;

/// Built-in tools, resources and prompts.
pub mod catalog;

/// Server assembly and relays.
pub mod core;

/// Tool and resource execution.
pub mod handler;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ServerBuilder;
pub use core::{Server, ServerStats};
pub use handler::ServerHandler;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::error::Result;
    use crate::identifiers::ResourceId;
    use crate::pool::{AutomationBackend, BrowserKind, MidOptions, ResourceLevel, TopOptions};
    use crate::protocol::ToolCall;

    /// Backend whose every call succeeds with a fixed id or value.
    pub(crate) struct NullBackend;

    #[async_trait]
    impl AutomationBackend for NullBackend {
        async fn create_top(&self, _: BrowserKind, _: &TopOptions) -> Result<ResourceId> {
            Ok(ResourceId::new("browser"))
        }

        async fn create_mid(&self, _: &ResourceId, _: &MidOptions) -> Result<ResourceId> {
            Ok(ResourceId::new("context"))
        }

        async fn create_leaf(&self, _: &ResourceId) -> Result<ResourceId> {
            Ok(ResourceId::new("page"))
        }

        async fn is_connected(&self, _: &ResourceId) -> bool {
            true
        }

        async fn close(&self, _: &ResourceId, _: ResourceLevel) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _: Option<&ResourceId>, _: &ToolCall) -> Result<Value> {
            Ok(json!(null))
        }
    }
}
