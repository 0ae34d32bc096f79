//! Subscription filters and history queries.
//!
//! A filter is a conjunction of optional clauses. Unset clauses, and clauses
//! given as empty lists, match everything.

// ============================================================================
// Imports
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifiers::ResourceId;

use super::record::{EventCategory, EventRecord, Severity};

// ============================================================================
// EventFilter
// ============================================================================

/// Predicate over [`EventRecord`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventFilter {
    /// Allowed event types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    /// Allowed categories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<EventCategory>>,
    /// Allowed severities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severities: Option<Vec<Severity>>,
    /// Required top-level resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_id: Option<ResourceId>,
    /// Required sub-context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ResourceId>,
    /// Required page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<ResourceId>,
    /// At least one of these tags must be present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Inclusive lower time bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper time bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Filter matching every event.
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to the given types.
    #[must_use]
    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to the given categories.
    #[must_use]
    pub fn categories(mut self, categories: impl IntoIterator<Item = EventCategory>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    /// Restricts to the given severities.
    #[must_use]
    pub fn severities(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.severities = Some(severities.into_iter().collect());
        self
    }

    /// Requires at least one of the given tags.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Requires events attributed to this page.
    #[must_use]
    pub fn page(mut self, page_id: impl Into<ResourceId>) -> Self {
        self.page_id = Some(page_id.into());
        self
    }

    /// Restricts to a time range.
    #[must_use]
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Returns `true` if `record` satisfies every specified clause.
    #[must_use]
    pub fn matches(&self, record: &EventRecord) -> bool {
        fn allowed<T: PartialEq>(list: Option<&Vec<T>>, value: &T) -> bool {
            match list {
                Some(list) if !list.is_empty() => list.contains(value),
                _ => true,
            }
        }

        fn same(expected: Option<&ResourceId>, actual: Option<&ResourceId>) -> bool {
            expected.is_none_or(|e| actual == Some(e))
        }

        if !allowed(self.types.as_ref(), &record.event_type)
            || !allowed(self.categories.as_ref(), &record.category)
            || !allowed(self.severities.as_ref(), &record.severity)
        {
            return false;
        }

        if !same(self.browser_id.as_ref(), record.source.browser_id.as_ref())
            || !same(self.context_id.as_ref(), record.source.context_id.as_ref())
            || !same(self.page_id.as_ref(), record.source.page_id.as_ref())
        {
            return false;
        }

        if let Some(tags) = self.tags.as_ref().filter(|t| !t.is_empty())
            && !tags.iter().any(|t| record.tags.contains(t))
        {
            return false;
        }

        self.since.is_none_or(|s| record.timestamp >= s)
            && self.until.is_none_or(|u| record.timestamp <= u)
    }

    /// Returns the single allowed type, if the filter pins exactly one.
    pub(crate) fn single_type(&self) -> Option<&str> {
        match self.types.as_deref() {
            Some([only]) => Some(only.as_str()),
            _ => None,
        }
    }

    /// Returns the single allowed category, if the filter pins exactly one.
    pub(crate) fn single_category(&self) -> Option<EventCategory> {
        match self.categories.as_deref() {
            Some([only]) => Some(*only),
            _ => None,
        }
    }
}

// ============================================================================
// EventQuery
// ============================================================================

/// History query: a filter plus a result limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventQuery {
    /// Predicate applied to history.
    #[serde(flatten)]
    pub filter: EventFilter,
    /// Maximum number of records returned.
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            filter: EventFilter::default(),
            limit: 100,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
