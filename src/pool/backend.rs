//! Automation backend boundary.
//!
//! The pool never drives an engine itself. Creation, liveness, teardown and
//! tool execution are delegated to an [`AutomationBackend`] implementation
//! supplied by the embedding application.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::ResourceId;
use crate::protocol::ToolCall;

use super::resource::{BrowserKind, MidOptions, ResourceLevel, TopOptions};

// ============================================================================
// AutomationBackend
// ============================================================================

/// External engine driver consumed by [`ResourcePool`](super::ResourcePool)
/// and by tool execution.
///
/// Implementations assign resource ids. Ids must be unique for the lifetime
/// of the backend.
#[async_trait]
pub trait AutomationBackend: Send + Sync + 'static {
    /// Launches a top-level engine instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`](crate::Error::Backend) if the launch fails.
    async fn create_top(&self, kind: BrowserKind, options: &TopOptions) -> Result<ResourceId>;

    /// Opens an isolated sub-context inside `top`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`](crate::Error::Backend) on failure.
    async fn create_mid(&self, top: &ResourceId, options: &MidOptions) -> Result<ResourceId>;

    /// Opens a page inside `mid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`](crate::Error::Backend) on failure.
    async fn create_leaf(&self, mid: &ResourceId) -> Result<ResourceId>;

    /// Liveness probe. Must not fail; an unreachable resource is `false`.
    async fn is_connected(&self, id: &ResourceId) -> bool;

    /// Tears down one resource. Children are closed first by the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`](crate::Error::Backend) on failure. The pool
    /// forgets the resource regardless.
    async fn close(&self, id: &ResourceId, level: ResourceLevel) -> Result<()>;

    /// Executes one tool call, on `page` when the call targets a page.
    ///
    /// # Errors
    ///
    /// Returns a structured [`Error::Backend`](crate::Error::Backend) when
    /// the primitive fails.
    async fn execute(&self, page: Option<&ResourceId>, call: &ToolCall) -> Result<Value>;
}
