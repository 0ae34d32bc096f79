//! Event system.
//!
//! Decoupled publish/subscribe over typed browser and server events with a
//! bounded, queryable history.
//!
//! # Flow
//!
//! ```text
//! producer ──publish(Event)──► EventBus ──► history (arena + indices)
//!                                   │
//!                                   └──► active subscriptions whose filter matches
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `record` | [`Event`], [`EventRecord`] and their classification |
//! | `filter` | [`EventFilter`] predicate and [`EventQuery`] |
//! | `bus` | [`EventBus`] |

// ============================================================================
// Submodules
// ============================================================================

/// Publish/subscribe bus.
pub mod bus;

/// Subscription filters and history queries.
pub mod filter;

/// Event records.
pub mod record;

// ============================================================================
// Re-exports
// ============================================================================

pub use bus::{EventBus, EventBusStats, EventCallback, SubscriptionInfo, event_callback};
pub use filter::{EventFilter, EventQuery};
pub use record::{Event, EventCategory, EventRecord, EventSource, Severity};
