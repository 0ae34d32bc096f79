//! Resource pool.
//!
//! Manages the three-level automation hierarchy (browser, context, page)
//! on top of an external [`AutomationBackend`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `backend` | [`AutomationBackend`] trait |
//! | `resource` | Levels, kinds, options and snapshots |
//! | `manager` | [`ResourcePool`] |

// ============================================================================
// Submodules
// ============================================================================

/// Automation backend trait.
pub mod backend;

/// Pool manager.
pub mod manager;

/// Resource types.
pub mod resource;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::AutomationBackend;
pub use manager::{CloseReason, PoolEvent, PoolStats, ResourcePool};
pub use resource::{
    BrowserKind, MidOptions, ResourceInfo, ResourceLevel, TopOptions, Viewport,
};
