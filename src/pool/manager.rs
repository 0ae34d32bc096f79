//! Hierarchical resource pool.
//!
//! Owns the browser → context → page tree, reuses what it can, and watches
//! top-level resources for disconnection.
//!
//! # Reuse policy
//!
//! | Level | Acquire behavior |
//! |-------|------------------|
//! | Top | Most recently created healthy resource of the same kind, else create |
//! | Mid | Always create, unless `reuse_empty_contexts` is set and options are empty |
//! | Leaf | Most recently created connected page, else create |
//!
//! Closing any node closes its whole subtree, deepest first.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::identifiers::ResourceId;
use crate::periodic::PeriodicTask;

use super::backend::AutomationBackend;
use super::resource::{
    BrowserKind, MidOptions, ResourceInfo, ResourceLevel, ResourceNode, TopOptions,
};

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the pool event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// PoolEvent
// ============================================================================

/// Why a resource left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
    /// Explicit close call.
    Requested,
    /// Health check or sweep found it disconnected.
    Disconnected,
    /// Pool cleanup.
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Lifecycle notification emitted by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PoolEvent {
    /// A resource was created through the backend.
    Created {
        /// New resource.
        id: ResourceId,
        /// Its level.
        level: ResourceLevel,
        /// Engine family.
        kind: BrowserKind,
        /// Enclosing resources, browser first.
        ancestors: Vec<ResourceId>,
    },
    /// An existing resource satisfied an acquire.
    Reused {
        /// Reused resource.
        id: ResourceId,
        /// Its level.
        level: ResourceLevel,
        /// Enclosing resources, browser first.
        ancestors: Vec<ResourceId>,
    },
    /// A resource was removed from the pool.
    Closed {
        /// Removed resource.
        id: ResourceId,
        /// Its level.
        level: ResourceLevel,
        /// Enclosing resources at the time of removal, browser first.
        ancestors: Vec<ResourceId>,
        /// Why it was removed.
        reason: CloseReason,
    },
}

impl PoolEvent {
    /// Resource the event concerns.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Created { id, .. } | Self::Reused { id, .. } | Self::Closed { id, .. } => id,
        }
    }

    /// Resources enclosing [`id`](Self::id), browser first.
    ///
    /// Empty for a browser, one entry for a context, two for a page.
    #[must_use]
    pub fn ancestors(&self) -> &[ResourceId] {
        match self {
            Self::Created { ancestors, .. }
            | Self::Reused { ancestors, .. }
            | Self::Closed { ancestors, .. } => ancestors,
        }
    }
}

// ============================================================================
// PoolStats
// ============================================================================

/// Pool occupancy and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// All tracked resources.
    pub total: usize,
    /// Top-level resources.
    pub browsers: usize,
    /// Sub-contexts.
    pub contexts: usize,
    /// Pages.
    pub pages: usize,
    /// Resources believed connected.
    pub connected: usize,
    /// Resources known to be disconnected but not yet removed.
    pub disconnected: usize,
    /// Top-level resources per engine family.
    pub by_kind: BTreeMap<String, usize>,
    /// Child count per parent id.
    pub children: BTreeMap<String, usize>,
    /// Running health monitors.
    pub monitors: usize,
    /// Resources created since start.
    pub created: u64,
    /// Acquires served by reuse.
    pub reused: u64,
    /// Resources closed since start.
    pub closed: u64,
    /// Failed health checks.
    pub health_failures: u64,
}

// ============================================================================
// Types
// ============================================================================

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    health_failures: AtomicU64,
}

/// Internal shared state for the pool.
struct PoolInner {
    config: PoolConfig,
    backend: Arc<dyn AutomationBackend>,
    nodes: Mutex<FxHashMap<ResourceId, ResourceNode>>,
    monitors: Mutex<FxHashMap<ResourceId, PeriodicTask>>,
    sweeper: Mutex<Option<PeriodicTask>>,
    /// Serializes acquisitions so capacity checks and creation are atomic.
    acquire: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PoolEvent>,
    seq: AtomicU64,
    counters: Counters,
}

// ============================================================================
// ResourcePool
// ============================================================================

/// Three-level resource pool with reuse and health monitoring.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("resources", &self.len())
            .field("monitors", &self.inner.monitors.lock().len())
            .finish_non_exhaustive()
    }
}

impl ResourcePool {
    /// Creates an empty pool over `backend`.
    #[must_use]
    pub fn new(config: PoolConfig, backend: Arc<dyn AutomationBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                config,
                backend,
                nodes: Mutex::new(FxHashMap::default()),
                monitors: Mutex::new(FxHashMap::default()),
                sweeper: Mutex::new(None),
                acquire: tokio::sync::Mutex::new(()),
                events,
                seq: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the automation backend.
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn AutomationBackend> {
        &self.inner.backend
    }

    /// Subscribes to pool lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// ResourcePool - Acquisition
// ============================================================================

impl ResourcePool {
    /// Returns a healthy top-level resource of `kind`, creating one if needed.
    ///
    /// Candidates that fail their liveness probe are closed on the spot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] at the top-level limit, or the
    /// backend's error if creation fails.
    pub async fn acquire_top(&self, kind: BrowserKind, options: &TopOptions) -> Result<ResourceId> {
        let _guard = self.inner.acquire.lock().await;

        loop {
            let candidate = {
                let nodes = self.inner.nodes.lock();
                nodes
                    .iter()
                    .filter(|(_, n)| n.level == ResourceLevel::Top && n.kind == kind && n.connected)
                    .max_by_key(|(_, n)| n.seq)
                    .map(|(id, _)| id.clone())
            };
            let Some(id) = candidate else {
                break;
            };

            if self.inner.backend.is_connected(&id).await {
                self.reuse(&id, ResourceLevel::Top);
                return Ok(id);
            }

            warn!(resource = %id, "Pooled browser failed liveness probe");
            self.mark_disconnected(&id);
            if let Err(e) = self.close_with_reason(&id, CloseReason::Disconnected).await {
                debug!(resource = %id, error = %e, "Stale browser already gone");
            }
        }

        let tops = self.count_level(ResourceLevel::Top);
        if tops >= self.inner.config.max_top {
            return Err(Error::pool_exhausted(format!(
                "browser limit of {} reached",
                self.inner.config.max_top
            )));
        }

        let id = self.inner.backend.create_top(kind, options).await?;
        let node = ResourceNode::new(ResourceLevel::Top, kind, None, self.next_seq());
        self.inner.nodes.lock().insert(id.clone(), node);
        self.start_monitor(&id);
        self.created(&id, ResourceLevel::Top, kind);

        info!(resource = %id, kind = %kind, "Browser created");
        Ok(id)
    }

    /// Returns an isolated sub-context under `top`.
    ///
    /// A new context is created on every call unless `reuse_empty_contexts`
    /// is configured and `options` is the empty configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] for an unknown `top`,
    /// [`Error::InvalidParams`] if `top` is not a browser,
    /// [`Error::ResourceDisconnected`] if it is down, or
    /// [`Error::PoolExhausted`] at the per-browser limit.
    pub async fn acquire_mid(&self, top: &ResourceId, options: &MidOptions) -> Result<ResourceId> {
        let _guard = self.inner.acquire.lock().await;

        let (kind, reusable) = {
            let nodes = self.inner.nodes.lock();
            let node = Self::expect_level(&nodes, top, ResourceLevel::Top)?;

            let reusable = if self.inner.config.reuse_empty_contexts && options.is_empty() {
                node.children
                    .iter()
                    .rev()
                    .find(|c| {
                        nodes
                            .get(*c)
                            .is_some_and(|m| m.connected && m.mid_options.is_empty())
                    })
                    .cloned()
            } else {
                None
            };

            if reusable.is_none() && node.children.len() >= self.inner.config.max_mid_per_top {
                return Err(Error::pool_exhausted(format!(
                    "context limit of {} reached for {top}",
                    self.inner.config.max_mid_per_top
                )));
            }
            (node.kind, reusable)
        };

        if let Some(id) = reusable {
            self.reuse(&id, ResourceLevel::Mid);
            return Ok(id);
        }

        let id = self.inner.backend.create_mid(top, options).await?;
        self.attach(top, &id, ResourceLevel::Mid, kind, options.clone())
            .await?;
        debug!(resource = %id, parent = %top, "Context created");
        Ok(id)
    }

    /// Returns the most recent connected page under `mid`, creating one if
    /// there is none.
    ///
    /// # Errors
    ///
    /// Same as [`create_leaf`](Self::create_leaf).
    pub async fn acquire_leaf(&self, mid: &ResourceId) -> Result<ResourceId> {
        let _guard = self.inner.acquire.lock().await;
        let existing = {
            let nodes = self.inner.nodes.lock();
            let node = Self::expect_level(&nodes, mid, ResourceLevel::Mid)?;
            node.children
                .iter()
                .rev()
                .find(|c| nodes.get(*c).is_some_and(|p| p.connected))
                .cloned()
        };
        if let Some(id) = existing {
            self.reuse(&id, ResourceLevel::Leaf);
            return Ok(id);
        }
        self.open_leaf(mid).await
    }

    /// Always opens a new page under `mid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] for an unknown `mid`,
    /// [`Error::InvalidParams`] if `mid` is not a context,
    /// [`Error::ResourceDisconnected`] if it is down, or
    /// [`Error::PoolExhausted`] at the per-context limit.
    pub async fn create_leaf(&self, mid: &ResourceId) -> Result<ResourceId> {
        let _guard = self.inner.acquire.lock().await;
        self.open_leaf(mid).await
    }

    /// Caller holds the acquire lock.
    async fn open_leaf(&self, mid: &ResourceId) -> Result<ResourceId> {
        let kind = {
            let nodes = self.inner.nodes.lock();
            let node = Self::expect_level(&nodes, mid, ResourceLevel::Mid)?;
            if node.children.len() >= self.inner.config.max_leaf_per_mid {
                return Err(Error::pool_exhausted(format!(
                    "page limit of {} reached for {mid}",
                    self.inner.config.max_leaf_per_mid
                )));
            }
            node.kind
        };

        let id = self.inner.backend.create_leaf(mid).await?;
        self.attach(mid, &id, ResourceLevel::Leaf, kind, MidOptions::default())
            .await?;
        debug!(resource = %id, parent = %mid, "Page created");
        Ok(id)
    }

    fn expect_level<'a>(
        nodes: &'a FxHashMap<ResourceId, ResourceNode>,
        id: &ResourceId,
        level: ResourceLevel,
    ) -> Result<&'a ResourceNode> {
        let node = nodes
            .get(id)
            .ok_or_else(|| Error::resource_not_found(id))?;
        if node.level != level {
            return Err(Error::invalid_params(format!(
                "{id} is a {}, expected a {level}",
                node.level
            )));
        }
        if !node.connected {
            return Err(Error::resource_disconnected(id));
        }
        Ok(node)
    }

    /// Links a freshly created child under `parent`.
    ///
    /// Close and health checks do not take the acquire lock, so the parent
    /// may have been removed or marked down while the backend was creating
    /// the child. In that case the orphan is closed again and the parent is
    /// reported as not found.
    async fn attach(
        &self,
        parent: &ResourceId,
        id: &ResourceId,
        level: ResourceLevel,
        kind: BrowserKind,
        mid_options: MidOptions,
    ) -> Result<()> {
        let attached = {
            let mut nodes = self.inner.nodes.lock();
            match nodes.get_mut(parent) {
                Some(p) if p.connected => {
                    p.children.push(id.clone());
                    p.last_used = Utc::now();
                    let mut node = ResourceNode::new(level, kind, Some(parent.clone()), self.next_seq());
                    node.mid_options = mid_options;
                    nodes.insert(id.clone(), node);
                    true
                }
                _ => false,
            }
        };

        if !attached {
            warn!(resource = %id, parent = %parent, "Parent closed during creation");
            if let Err(e) = self.inner.backend.close(id, level).await {
                debug!(resource = %id, error = %e, "Failed to close orphan");
            }
            return Err(Error::resource_not_found(parent));
        }

        self.created(id, level, kind);
        Ok(())
    }

    fn reuse(&self, id: &ResourceId, level: ResourceLevel) {
        self.touch(id);
        self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::Reused {
            id: id.clone(),
            level,
            ancestors: self.ancestors(id),
        });
        debug!(resource = %id, level = %level, "Resource reused");
    }

    fn created(&self, id: &ResourceId, level: ResourceLevel, kind: BrowserKind) {
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::Created {
            id: id.clone(),
            level,
            kind,
            ancestors: self.ancestors(id),
        });
    }

    fn ancestors(&self, id: &ResourceId) -> Vec<ResourceId> {
        ancestors_of(&self.inner.nodes.lock(), id)
    }
}

// ============================================================================
// ResourcePool - Teardown
// ============================================================================

impl ResourcePool {
    /// Closes `id` and all of its descendants, deepest first.
    ///
    /// Every id in the subtree is unknown to the pool once this returns,
    /// even if the backend reports errors while closing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if `id` is unknown.
    pub async fn close(&self, id: &ResourceId) -> Result<Vec<ResourceId>> {
        self.close_with_reason(id, CloseReason::Requested).await
    }

    async fn close_with_reason(
        &self,
        id: &ResourceId,
        reason: CloseReason,
    ) -> Result<Vec<ResourceId>> {
        let removed: Vec<(ResourceId, ResourceLevel, Vec<ResourceId>)> = {
            let mut nodes = self.inner.nodes.lock();
            let Some(node) = nodes.get(id) else {
                return Err(Error::resource_not_found(id));
            };

            if let Some(parent) = node.parent.clone()
                && let Some(p) = nodes.get_mut(&parent)
            {
                p.children.retain(|c| c != id);
            }

            let mut order = Vec::new();
            post_order(&nodes, id, &mut order);
            let lineages: Vec<Vec<ResourceId>> =
                order.iter().map(|rid| ancestors_of(&nodes, rid)).collect();
            order
                .into_iter()
                .zip(lineages)
                .filter_map(|(rid, ancestors)| {
                    nodes.remove(&rid).map(|n| (rid, n.level, ancestors))
                })
                .collect()
        };

        let stopped: Vec<PeriodicTask> = {
            let mut monitors = self.inner.monitors.lock();
            removed
                .iter()
                .filter_map(|(rid, _, _)| monitors.remove(rid))
                .collect()
        };
        drop(stopped);

        for (rid, level, ancestors) in &removed {
            if let Err(e) = self.inner.backend.close(rid, *level).await {
                debug!(resource = %rid, error = %e, "Backend close failed");
            }
            self.inner.counters.closed.fetch_add(1, Ordering::Relaxed);
            self.emit(PoolEvent::Closed {
                id: rid.clone(),
                level: *level,
                ancestors: ancestors.clone(),
                reason,
            });
        }

        info!(
            resource = %id,
            count = removed.len(),
            reason = reason.as_str(),
            "Resource tree closed"
        );
        Ok(removed.into_iter().map(|(rid, _, _)| rid).collect())
    }

    /// Stops all background work and closes every resource.
    pub async fn cleanup(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(task) = sweeper {
            task.shutdown().await;
        }

        let monitors: Vec<PeriodicTask> = self
            .inner
            .monitors
            .lock()
            .drain()
            .map(|(_, task)| task)
            .collect();
        drop(monitors);

        let tops = self.ids_at(ResourceLevel::Top);
        let count = tops.len();
        for id in tops {
            if let Err(e) = self.close_with_reason(&id, CloseReason::Shutdown).await {
                debug!(resource = %id, error = %e, "Close during cleanup failed");
            }
        }

        info!(browsers = count, "Resource pool cleaned up");
    }
}

/// Appends the subtree rooted at `id` to `out`, children before parents.
/// Parent chain of `id`, root first, excluding `id` itself.
fn ancestors_of(nodes: &FxHashMap<ResourceId, ResourceNode>, id: &ResourceId) -> Vec<ResourceId> {
    let mut chain = Vec::new();
    let mut current = nodes.get(id).and_then(|n| n.parent.as_ref());
    while let Some(parent) = current {
        chain.push(parent.clone());
        current = nodes.get(parent).and_then(|n| n.parent.as_ref());
    }
    chain.reverse();
    chain
}

fn post_order(
    nodes: &FxHashMap<ResourceId, ResourceNode>,
    id: &ResourceId,
    out: &mut Vec<ResourceId>,
) {
    if let Some(node) = nodes.get(id) {
        for child in &node.children {
            post_order(nodes, child, out);
        }
    }
    out.push(id.clone());
}

// ============================================================================
// ResourcePool - Health
// ============================================================================

impl ResourcePool {
    fn start_monitor(&self, id: &ResourceId) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let target = id.clone();

        let task = PeriodicTask::spawn(
            "health-check",
            self.inner.config.health_check_interval,
            move || {
                let weak = weak.clone();
                let target = target.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    let pool = ResourcePool { inner };
                    if !pool.contains(&target) {
                        return ControlFlow::Break(());
                    }
                    if pool.inner.backend.is_connected(&target).await {
                        return ControlFlow::Continue(());
                    }

                    pool.inner
                        .counters
                        .health_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(resource = %target, "Health check failed; closing resource tree");
                    pool.mark_disconnected(&target);

                    // Closing stops this monitor, so it must run on its own task.
                    tokio::spawn(async move {
                        if let Err(e) = pool
                            .close_with_reason(&target, CloseReason::Disconnected)
                            .await
                        {
                            debug!(resource = %target, error = %e, "Disconnected browser already gone");
                        }
                    });
                    ControlFlow::Break(())
                }
            },
        );

        self.inner.monitors.lock().insert(id.clone(), task);
    }

    fn mark_disconnected(&self, id: &ResourceId) {
        if let Some(node) = self.inner.nodes.lock().get_mut(id) {
            node.connected = false;
        }
    }

    /// Probes every browser and closes those that are down.
    ///
    /// Returns how many browser trees were closed.
    pub async fn sweep(&self) -> usize {
        let mut closed = 0;
        for id in self.ids_at(ResourceLevel::Top) {
            if self.inner.backend.is_connected(&id).await {
                continue;
            }
            self.mark_disconnected(&id);
            match self.close_with_reason(&id, CloseReason::Disconnected).await {
                Ok(_) => closed += 1,
                Err(e) => debug!(resource = %id, error = %e, "Swept browser already gone"),
            }
        }
        if closed > 0 {
            info!(closed, "Sweep removed disconnected browsers");
        }
        closed
    }

    /// Starts the periodic sweep.
    pub fn start_sweeper(&self) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn("pool-sweep", self.inner.config.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                ResourcePool { inner }.sweep().await;
                ControlFlow::Continue(())
            }
        });
        *self.inner.sweeper.lock() = Some(task);
    }
}

// ============================================================================
// ResourcePool - Inspection
// ============================================================================

impl ResourcePool {
    /// Number of tracked resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.nodes.lock().len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `id` is tracked.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.inner.nodes.lock().contains_key(id)
    }

    /// Snapshot of one resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<ResourceInfo> {
        self.inner.nodes.lock().get(id).map(|n| n.info(id))
    }

    /// Resolves a page id for tool execution and marks it used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`], [`Error::InvalidParams`] for a
    /// non-page id, or [`Error::ResourceDisconnected`].
    pub fn page(&self, id: &ResourceId) -> Result<ResourceInfo> {
        let mut nodes = self.inner.nodes.lock();
        let info = Self::expect_level(&nodes, id, ResourceLevel::Leaf)?.info(id);
        if let Some(node) = nodes.get_mut(id) {
            node.last_used = Utc::now();
        }
        Ok(info)
    }

    /// Updates the last-used time of `id`.
    pub fn touch(&self, id: &ResourceId) {
        if let Some(node) = self.inner.nodes.lock().get_mut(id) {
            node.last_used = Utc::now();
        }
    }

    /// Ids from the root browser down to `id`.
    #[must_use]
    pub fn lineage(&self, id: &ResourceId) -> Option<Vec<ResourceId>> {
        let nodes = self.inner.nodes.lock();
        let mut path = vec![id.clone()];
        let mut current = nodes.get(id)?;
        while let Some(parent) = &current.parent {
            path.push(parent.clone());
            current = nodes.get(parent)?;
        }
        path.reverse();
        Some(path)
    }

    /// Most recently created connected child of `id`.
    #[must_use]
    pub fn latest_child(&self, id: &ResourceId) -> Option<ResourceId> {
        let nodes = self.inner.nodes.lock();
        nodes
            .get(id)?
            .children
            .iter()
            .rev()
            .find(|c| nodes.get(*c).is_some_and(|n| n.connected))
            .cloned()
    }

    /// Snapshots of all resources, optionally at one level, oldest first.
    #[must_use]
    pub fn list(&self, level: Option<ResourceLevel>) -> Vec<ResourceInfo> {
        let nodes = self.inner.nodes.lock();
        let mut entries: Vec<(&ResourceId, &ResourceNode)> = nodes
            .iter()
            .filter(|(_, n)| level.is_none_or(|l| n.level == l))
            .collect();
        entries.sort_by_key(|(_, n)| n.seq);
        entries.into_iter().map(|(id, n)| n.info(id)).collect()
    }

    fn ids_at(&self, level: ResourceLevel) -> Vec<ResourceId> {
        self.list(Some(level)).into_iter().map(|i| i.id).collect()
    }

    fn count_level(&self, level: ResourceLevel) -> usize {
        self.inner
            .nodes
            .lock()
            .values()
            .filter(|n| n.level == level)
            .count()
    }

    /// Returns occupancy and counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        {
            let nodes = self.inner.nodes.lock();
            for (id, node) in nodes.iter() {
                stats.total += 1;
                match node.level {
                    ResourceLevel::Top => {
                        stats.browsers += 1;
                        *stats.by_kind.entry(node.kind.to_string()).or_default() += 1;
                    }
                    ResourceLevel::Mid => stats.contexts += 1,
                    ResourceLevel::Leaf => stats.pages += 1,
                }
                if node.connected {
                    stats.connected += 1;
                } else {
                    stats.disconnected += 1;
                }
                if !node.children.is_empty() {
                    stats
                        .children
                        .insert(id.to_string(), node.children.len());
                }
            }
        }
        stats.monitors = self.inner.monitors.lock().len();
        let counters = &self.inner.counters;
        stats.created = counters.created.load(Ordering::Relaxed);
        stats.reused = counters.reused.load(Ordering::Relaxed);
        stats.closed = counters.closed.load(Ordering::Relaxed);
        stats.health_failures = counters.health_failures.load(Ordering::Relaxed);
        stats
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use rustc_hash::FxHashSet;
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    use crate::protocol::ToolCall;

    #[derive(Default)]
    struct MockBackend {
        next: AtomicU64,
        dead: Mutex<FxHashSet<ResourceId>>,
        closed: Mutex<Vec<ResourceId>>,
        /// When set, page creation signals the first and waits on the second.
        leaf_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    }

    impl MockBackend {
        fn mint(&self, prefix: &str) -> ResourceId {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            ResourceId::new(format!("{prefix}-{n}"))
        }

        fn kill(&self, id: &ResourceId) {
            self.dead.lock().insert(id.clone());
        }
    }

    #[async_trait]
    impl AutomationBackend for MockBackend {
        async fn create_top(&self, _: BrowserKind, _: &TopOptions) -> Result<ResourceId> {
            Ok(self.mint("browser"))
        }

        async fn create_mid(&self, _: &ResourceId, _: &MidOptions) -> Result<ResourceId> {
            Ok(self.mint("context"))
        }

        async fn create_leaf(&self, _: &ResourceId) -> Result<ResourceId> {
            let gate = self.leaf_gate.lock().clone();
            if let Some((entered, release)) = gate {
                entered.notify_one();
                release.notified().await;
            }
            Ok(self.mint("page"))
        }

        async fn is_connected(&self, id: &ResourceId) -> bool {
            !self.dead.lock().contains(id)
        }

        async fn close(&self, id: &ResourceId, _: ResourceLevel) -> Result<()> {
            self.closed.lock().push(id.clone());
            Ok(())
        }

        async fn execute(&self, _: Option<&ResourceId>, _: &ToolCall) -> Result<Value> {
            Ok(json!({ "ok": true }))
        }
    }

    fn pool_with(config: PoolConfig) -> (ResourcePool, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        (ResourcePool::new(config, backend.clone()), backend)
    }

    fn pool() -> (ResourcePool, Arc<MockBackend>) {
        pool_with(PoolConfig::default())
    }

    #[tokio::test]
    async fn test_top_reuse_by_kind() {
        let (pool, _) = pool();
        let a = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let b = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let c = pool.acquire_top(BrowserKind::Firefox, &TopOptions::default()).await.expect("top");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.stats().monitors, 2);
    }

    #[tokio::test]
    async fn test_dead_top_is_replaced() {
        let (pool, backend) = pool();
        let a = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        backend.kill(&a);

        let b = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        assert_ne!(a, b);
        assert!(!pool.contains(&a));
    }

    #[tokio::test]
    async fn test_mid_created_fresh_by_default() {
        let (pool, _) = pool();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let m1 = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        let m2 = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        assert_ne!(m1, m2);
    }

    #[tokio::test]
    async fn test_mid_reuse_only_for_empty_options() {
        let (pool, _) = pool_with(PoolConfig {
            reuse_empty_contexts: true,
            ..PoolConfig::default()
        });
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");

        let m1 = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        let m2 = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        assert_eq!(m1, m2);

        let german = MidOptions {
            locale: Some("de-DE".into()),
            ..MidOptions::default()
        };
        let m3 = pool.acquire_mid(&top, &german).await.expect("mid");
        let m4 = pool.acquire_mid(&top, &german).await.expect("mid");
        assert_ne!(m3, m1);
        assert_ne!(m3, m4);
    }

    #[tokio::test]
    async fn test_leaf_reuse_prefers_latest() {
        let (pool, _) = pool();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");

        let p1 = pool.acquire_leaf(&mid).await.expect("leaf");
        assert_eq!(pool.acquire_leaf(&mid).await.expect("leaf"), p1);

        let p2 = pool.create_leaf(&mid).await.expect("leaf");
        assert_ne!(p1, p2);
        assert_eq!(pool.acquire_leaf(&mid).await.expect("leaf"), p2);
    }

    #[tokio::test]
    async fn test_parent_lost_while_page_is_created() {
        let (pool, backend) = pool();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let closed_mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        let down_mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");

        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *backend.leaf_gate.lock() = Some((entered.clone(), release.clone()));

        // Removed outright.
        let task = tokio::spawn({
            let pool = pool.clone();
            let mid = closed_mid.clone();
            async move { pool.acquire_leaf(&mid).await }
        });
        entered.notified().await;
        pool.close(&closed_mid).await.expect("close");
        release.notify_one();
        let err = task.await.expect("join").expect_err("parent gone");
        assert!(matches!(err, Error::ResourceNotFound { ref resource_id } if *resource_id == closed_mid));

        // Still present but marked down.
        let task = tokio::spawn({
            let pool = pool.clone();
            let mid = down_mid.clone();
            async move { pool.create_leaf(&mid).await }
        });
        entered.notified().await;
        pool.mark_disconnected(&down_mid);
        release.notify_one();
        let err = task.await.expect("join").expect_err("parent down");
        assert!(matches!(err, Error::ResourceNotFound { ref resource_id } if *resource_id == down_mid));

        assert_eq!(pool.stats().pages, 0);
        assert!(pool.contains(&down_mid));
        assert_eq!(pool.latest_child(&down_mid), None);
        let orphans = backend
            .closed
            .lock()
            .iter()
            .filter(|id| id.as_str().starts_with("page-"))
            .count();
        assert_eq!(orphans, 2);
    }

    #[tokio::test]
    async fn test_events_carry_ancestors() {
        let (pool, _) = pool();
        let mut events = pool.subscribe();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        let page = pool.acquire_leaf(&mid).await.expect("leaf");
        pool.acquire_leaf(&mid).await.expect("reuse");
        pool.close(&top).await.expect("close");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let lineage = |id: &ResourceId, closed: bool| {
            seen.iter()
                .filter(|e| e.id() == id && matches!(e, PoolEvent::Closed { .. }) == closed)
                .map(|e| e.ancestors().to_vec())
                .collect::<Vec<_>>()
        };

        assert_eq!(lineage(&top, false), vec![Vec::<ResourceId>::new()]);
        assert_eq!(lineage(&mid, false), vec![vec![top.clone()]]);
        assert_eq!(
            lineage(&page, false),
            vec![vec![top.clone(), mid.clone()], vec![top.clone(), mid.clone()]]
        );
        assert_eq!(lineage(&page, true), vec![vec![top.clone(), mid.clone()]]);
        assert_eq!(lineage(&mid, true), vec![vec![top.clone()]]);
    }

    #[tokio::test]
    async fn test_wrong_level_and_unknown_ids() {
        let (pool, _) = pool();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");

        assert!(matches!(
            pool.acquire_leaf(&top).await,
            Err(Error::InvalidParams { .. })
        ));
        assert!(matches!(
            pool.acquire_mid(&ResourceId::new("nope"), &MidOptions::default()).await,
            Err(Error::ResourceNotFound { .. })
        ));
        assert!(matches!(pool.page(&top), Err(Error::InvalidParams { .. })));
    }

    #[tokio::test]
    async fn test_close_cascades_whole_tree() {
        let (pool, backend) = pool();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let m1 = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        let m2 = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        let p1 = pool.acquire_leaf(&m1).await.expect("leaf");
        let p2 = pool.acquire_leaf(&m2).await.expect("leaf");

        let closed = pool.close(&top).await.expect("close");
        assert_eq!(closed.len(), 5);
        for id in [&top, &m1, &m2, &p1, &p2] {
            assert!(!pool.contains(id), "{id} still pooled");
        }
        assert!(pool.is_empty());
        assert_eq!(pool.stats().monitors, 0);

        let order = backend.closed.lock().clone();
        let pos = |id: &ResourceId| order.iter().position(|c| c == id).expect("closed");
        assert!(pos(&p1) < pos(&m1));
        assert!(pos(&m1) < pos(&top));
        assert!(pos(&p2) < pos(&m2));
    }

    #[tokio::test]
    async fn test_close_mid_detaches_from_parent() {
        let (pool, _) = pool();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        pool.close(&mid).await.expect("close");

        assert!(pool.get(&top).expect("top").children.is_empty());
        assert!(matches!(pool.close(&mid).await, Err(Error::ResourceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_capacity_limits() {
        let (pool, _) = pool_with(PoolConfig {
            max_top: 1,
            max_mid_per_top: 1,
            max_leaf_per_mid: 1,
            ..PoolConfig::default()
        });
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        assert!(matches!(
            pool.acquire_top(BrowserKind::Firefox, &TopOptions::default()).await,
            Err(Error::PoolExhausted { .. })
        ));

        let mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        assert!(pool.acquire_mid(&top, &MidOptions::default()).await.is_err());

        pool.create_leaf(&mid).await.expect("leaf");
        assert!(pool.create_leaf(&mid).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_closes_dead_browser() {
        let (pool, backend) = pool_with(PoolConfig {
            health_check_interval: Duration::from_secs(1),
            ..PoolConfig::default()
        });
        let mut events = pool.subscribe();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");

        backend.kill(&top);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert!(!pool.contains(&top));
        assert!(!pool.contains(&mid));
        assert_eq!(pool.stats().monitors, 0);
        assert_eq!(pool.stats().health_failures, 1);

        let mut closed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::Closed { id, reason, .. } = event {
                assert_eq!(reason, CloseReason::Disconnected);
                closed.push(id);
            }
        }
        assert_eq!(closed, vec![mid, top]);
    }

    #[tokio::test]
    async fn test_sweep_and_stats() {
        let (pool, backend) = pool();
        let a = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let b = pool.acquire_top(BrowserKind::Firefox, &TopOptions::default()).await.expect("top");
        let mid = pool.acquire_mid(&b, &MidOptions::default()).await.expect("mid");
        pool.acquire_leaf(&mid).await.expect("leaf");

        let stats = pool.stats();
        assert_eq!((stats.browsers, stats.contexts, stats.pages), (2, 1, 1));
        assert_eq!(stats.by_kind.get("firefox"), Some(&1));
        assert_eq!(stats.children.get(b.as_str()), Some(&1));

        backend.kill(&a);
        assert_eq!(pool.sweep().await, 1);
        assert_eq!(pool.stats().browsers, 1);
    }

    #[tokio::test]
    async fn test_lineage_and_cleanup() {
        let (pool, _) = pool();
        let top = pool.acquire_top(BrowserKind::Chromium, &TopOptions::default()).await.expect("top");
        let mid = pool.acquire_mid(&top, &MidOptions::default()).await.expect("mid");
        let page = pool.acquire_leaf(&mid).await.expect("leaf");

        assert_eq!(pool.lineage(&page), Some(vec![top.clone(), mid.clone(), page.clone()]));
        assert_eq!(pool.latest_child(&top), Some(mid));

        pool.start_sweeper();
        pool.cleanup().await;
        assert!(pool.is_empty());
        assert_eq!(pool.stats().monitors, 0);
    }
}
