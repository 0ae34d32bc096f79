//! Resource hierarchy types.
//!
//! Three levels: a top-level engine instance owns isolated sub-contexts,
//! which own leaf pages. Parents are referenced by id only.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifiers::ResourceId;

// ============================================================================
// ResourceLevel
// ============================================================================

/// Position of a resource in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceLevel {
    /// Engine instance.
    #[serde(rename = "browser")]
    Top,
    /// Isolated sub-context.
    #[serde(rename = "context")]
    Mid,
    /// Page.
    #[serde(rename = "page")]
    Leaf,
}

impl ResourceLevel {
    /// Wire name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Top => "browser",
            Self::Mid => "context",
            Self::Leaf => "page",
        }
    }

    /// Level of this level's children, if any.
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Top => Some(Self::Mid),
            Self::Mid => Some(Self::Leaf),
            Self::Leaf => None,
        }
    }
}

impl fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// BrowserKind
// ============================================================================

/// Engine family of a top-level resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    /// Chromium-based engine.
    #[default]
    Chromium,
    /// Gecko-based engine.
    Firefox,
    /// WebKit-based engine.
    Webkit,
}

impl BrowserKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
            Self::Webkit => "webkit",
        }
    }
}

impl fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Options
// ============================================================================

/// Launch options for a top-level resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TopOptions {
    /// Run without a visible window.
    pub headless: bool,
    /// Extra engine command-line arguments.
    pub args: Vec<String>,
    /// Explicit engine binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
}

impl Default for TopOptions {
    fn default() -> Self {
        Self {
            headless: true,
            args: Vec::new(),
            executable_path: None,
        }
    }
}

/// Viewport dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

/// Options for an isolated sub-context.
///
/// The all-`None` value is the *empty* configuration; only that one is ever
/// eligible for reuse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MidOptions {
    /// Initial viewport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    /// User-agent override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Locale override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Headers added to every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<BTreeMap<String, String>>,
}

impl MidOptions {
    /// Returns `true` for the empty configuration.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

// ============================================================================
// ResourceInfo
// ============================================================================

/// Snapshot of one pooled resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Resource id.
    pub id: ResourceId,
    /// Hierarchy level.
    pub level: ResourceLevel,
    /// Engine family, inherited from the top-level ancestor.
    pub kind: BrowserKind,
    /// Owning resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ResourceId>,
    /// Owned resources, oldest first.
    pub children: Vec<ResourceId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last acquisition or use.
    pub last_used: DateTime<Utc>,
    /// Last known liveness.
    pub connected: bool,
}

// ============================================================================
// ResourceNode
// ============================================================================

/// Pool-internal bookkeeping for one resource.
#[derive(Debug, Clone)]
pub(crate) struct ResourceNode {
    pub level: ResourceLevel,
    pub kind: BrowserKind,
    pub parent: Option<ResourceId>,
    pub children: Vec<ResourceId>,
    /// Creation order across the whole pool.
    pub seq: u64,
    pub mid_options: MidOptions,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub connected: bool,
}

impl ResourceNode {
    pub fn new(
        level: ResourceLevel,
        kind: BrowserKind,
        parent: Option<ResourceId>,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            level,
            kind,
            parent,
            children: Vec::new(),
            seq,
            mid_options: MidOptions::default(),
            created_at: now,
            last_used: now,
            connected: true,
        }
    }

    pub fn info(&self, id: &ResourceId) -> ResourceInfo {
        ResourceInfo {
            id: id.clone(),
            level: self.level,
            kind: self.kind,
            parent: self.parent.clone(),
            children: self.children.clone(),
            created_at: self.created_at,
            last_used: self.last_used,
            connected: self.connected,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
