//! Event records and their classification.
//!
//! An [`Event`] is what a producer hands to the bus; the bus stamps it with
//! an id, a sequence number and a timestamp and stores it as an
//! [`EventRecord`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::{EventId, ResourceId};

// ============================================================================
// EventCategory
// ============================================================================

/// Coarse grouping used for routing and notification method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Resource creation and teardown.
    Lifecycle,
    /// Network traffic observed by the backend.
    Network,
    /// Page console output.
    Console,
    /// Failures.
    Error,
    /// Timing and resource usage.
    Performance,
    /// Tool invocations passing through the server.
    Tool,
    /// Transport connects and disconnects.
    Transport,
}

impl EventCategory {
    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Network => "network",
            Self::Console => "console",
            Self::Error => "error",
            Self::Performance => "performance",
            Self::Tool => "tool",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Severity
// ============================================================================

/// Event severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Something unexpected that did not fail.
    Warning,
    /// A failed operation.
    Error,
    /// A failure that takes a resource down.
    Critical,
}

// ============================================================================
// EventSource
// ============================================================================

/// Where in the automation hierarchy an event originated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    /// Top-level engine instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_id: Option<ResourceId>,
    /// Isolated sub-context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ResourceId>,
    /// Leaf page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<ResourceId>,
}

impl EventSource {
    /// Source attributed to a top-level resource.
    #[must_use]
    pub fn browser(id: impl Into<ResourceId>) -> Self {
        Self {
            browser_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Source attributed to a page.
    #[must_use]
    pub fn page(id: impl Into<ResourceId>) -> Self {
        Self {
            page_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Composite key used by the source index.
    #[must_use]
    pub fn key(&self) -> String {
        fn part(id: Option<&ResourceId>) -> &str {
            id.map_or("-", ResourceId::as_str)
        }
        format!(
            "{}|{}|{}",
            part(self.browser_id.as_ref()),
            part(self.context_id.as_ref()),
            part(self.page_id.as_ref())
        )
    }

    /// Returns `true` if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.browser_id.is_none() && self.context_id.is_none() && self.page_id.is_none()
    }
}

// ============================================================================
// Event
// ============================================================================

/// An occurrence submitted for publication.
#[derive(Debug, Clone)]
pub struct Event {
    /// Fine-grained type, e.g. `network` or `page.created`.
    pub event_type: String,
    /// Coarse category.
    pub category: EventCategory,
    /// Origin in the hierarchy.
    pub source: EventSource,
    /// Severity.
    pub severity: Severity,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Payload.
    pub data: Value,
}

impl Event {
    /// Creates an info-level event with no source, tags or payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            event_type: event_type.into(),
            category,
            source: EventSource::default(),
            severity: Severity::Info,
            tags: Vec::new(),
            data: Value::Null,
        }
    }

    /// Sets the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

// ============================================================================
// EventRecord
// ============================================================================

/// A published event as stored in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Unique id.
    pub id: EventId,
    /// Monotonic publication sequence number.
    pub seq: u64,
    /// Fine-grained type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Coarse category.
    pub category: EventCategory,
    /// Origin in the hierarchy.
    pub source: EventSource,
    /// Severity.
    pub severity: Severity,
    /// Tags.
    pub tags: Vec<String>,
    /// Payload.
    pub data: Value,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub(crate) fn from_event(event: Event, seq: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: EventId::generate(),
            seq,
            event_type: event.event_type,
            category: event.category,
            source: event.source,
            severity: event.severity,
            tags: event.tags,
            data: event.data,
            timestamp,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
