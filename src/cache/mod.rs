//! Cache layer.
//!
//! Two independent stores sit in front of the automation backend:
//!
//! | Module | Description |
//! |--------|-------------|
//! | `key` | Call fingerprints and the per-call [`PolicyTable`] |
//! | `response` | [`ResponseCache`]: bounded LRU with TTL and tag invalidation |
//! | `session` | [`SessionCache`]: checksum-validated session state with a disk mirror |

// ============================================================================
// Submodules
// ============================================================================

/// Cache keys and policies.
pub mod key;

/// Response cache.
pub mod response;

/// Session-state cache.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use key::{CachePolicy, PolicyTable, canonical_json, fingerprint};
pub use response::{CacheStats, EntryInfo, ResponseCache};
pub use session::{BackupInfo, SessionCache, SessionCacheStats, SessionEntry, SessionSummary};
