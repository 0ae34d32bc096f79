//! Publish/subscribe bus with bounded, indexed history.
//!
//! History is an arena of records keyed by publication sequence number.
//! Three secondary indices (type, category, composite source key) map to
//! sequence numbers and are only ever mutated together with the arena, inside
//! the same write-lock section.
//!
//! Delivery runs after the history lock is released, so a callback may
//! publish or subscribe again without deadlocking. Each callback is isolated:
//! an error or panic in one is logged and delivery continues with the next.

// ============================================================================
// Imports
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::EventConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, EventId, SubscriptionId};
use crate::periodic::PeriodicTask;

use super::filter::{EventFilter, EventQuery};
use super::record::{Event, EventCategory, EventRecord, EventSource};

// ============================================================================
// Types
// ============================================================================

/// Subscriber callback.
///
/// Returning an error marks the delivery as failed; it never affects other
/// subscribers.
pub type EventCallback = Arc<dyn Fn(&EventRecord) -> Result<()> + Send + Sync>;

/// Wraps a closure as an [`EventCallback`].
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(&EventRecord) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A standing interest registration.
struct Subscription {
    filter: EventFilter,
    callback: EventCallback,
    active: bool,
    owner: Option<ConnectionId>,
    delivered: u64,
}

/// Snapshot of a subscription for inspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Filter in force.
    pub filter: EventFilter,
    /// Whether delivery is enabled.
    pub active: bool,
    /// Owning connection, if any.
    pub owner: Option<ConnectionId>,
    /// Events delivered so far.
    pub delivered: u64,
}

/// Bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusStats {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Successful callback invocations.
    pub delivered: u64,
    /// Callback invocations that errored or panicked.
    pub delivery_failures: u64,
    /// Records currently held in history.
    pub history_size: usize,
    /// Registered subscriptions.
    pub subscriptions: usize,
}

// ============================================================================
// History
// ============================================================================

/// Authoritative table plus secondary indices.
#[derive(Default)]
struct History {
    next_seq: u64,
    records: BTreeMap<u64, EventRecord>,
    by_id: FxHashMap<EventId, u64>,
    by_type: FxHashMap<String, BTreeSet<u64>>,
    by_category: FxHashMap<EventCategory, BTreeSet<u64>>,
    by_source: FxHashMap<String, BTreeSet<u64>>,
}

impl History {
    fn insert(&mut self, event: Event, timestamp: DateTime<Utc>) -> EventRecord {
        self.next_seq += 1;
        let record = EventRecord::from_event(event, self.next_seq, timestamp);
        self.index(&record);
        self.records.insert(record.seq, record.clone());
        record
    }

    fn index(&mut self, record: &EventRecord) {
        self.by_id.insert(record.id, record.seq);
        self.by_type
            .entry(record.event_type.clone())
            .or_default()
            .insert(record.seq);
        self.by_category
            .entry(record.category)
            .or_default()
            .insert(record.seq);
        self.by_source
            .entry(record.source.key())
            .or_default()
            .insert(record.seq);
    }

    /// Removes a record from the table and every index.
    fn remove(&mut self, seq: u64) -> Option<EventRecord> {
        let record = self.records.remove(&seq)?;
        self.by_id.remove(&record.id);
        unindex(&mut self.by_type, &record.event_type, seq);
        unindex(&mut self.by_category, &record.category, seq);
        unindex(&mut self.by_source, &record.source.key(), seq);
        Some(record)
    }

    /// Keeps the newest `cap` records, evicting oldest first.
    fn retain_newest(&mut self, cap: usize) -> usize {
        let mut removed = 0;
        while self.records.len() > cap {
            let Some(&oldest) = self.records.keys().next() else {
                break;
            };
            self.remove(oldest);
            removed += 1;
        }
        removed
    }

    /// Drops records published before `cutoff`.
    fn retain_since(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<u64> = self
            .records
            .values()
            .filter(|r| r.timestamp < cutoff)
            .map(|r| r.seq)
            .collect();
        for seq in &expired {
            self.remove(*seq);
        }
        expired.len()
    }

    fn newest<'a>(
        &'a self,
        seqs: impl DoubleEndedIterator<Item = &'a u64>,
        filter: &'a EventFilter,
        limit: usize,
    ) -> Vec<EventRecord> {
        seqs.rev()
            .filter_map(|seq| self.records.get(seq))
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect()
    }
}

fn unindex<K, Q>(index: &mut FxHashMap<K, BTreeSet<u64>>, key: &Q, seq: u64)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(seqs) = index.get_mut(key) {
        seqs.remove(&seq);
        if seqs.is_empty() {
            index.remove(key);
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

struct BusInner {
    config: EventConfig,
    history: RwLock<History>,
    subscriptions: RwLock<FxHashMap<SubscriptionId, Subscription>>,
    published: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
    maintenance: Mutex<Option<PeriodicTask>>,
}

/// Typed publish/subscribe bus.
///
/// Cheap to clone; clones share the same history and subscriptions.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("history", &self.inner.history.read().records.len())
            .field("subscriptions", &self.inner.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new(config: EventConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                history: RwLock::new(History::default()),
                subscriptions: RwLock::new(FxHashMap::default()),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                delivery_failures: AtomicU64::new(0),
                maintenance: Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// EventBus - Publishing
// ============================================================================

impl EventBus {
    /// Publishes an event and synchronously notifies matching subscribers.
    ///
    /// Returns the stored record.
    pub fn publish(&self, event: Event) -> EventRecord {
        let record = {
            let mut history = self.inner.history.write();
            let record = history.insert(event, Utc::now());
            let pruned = history.retain_newest(self.inner.config.max_history);
            if pruned > 0 {
                debug!(pruned, cap = self.inner.config.max_history, "Event history pruned");
            }
            record
        };
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<(SubscriptionId, EventCallback)> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|(_, sub)| sub.active && sub.filter.matches(&record))
            .map(|(id, sub)| (*id, Arc::clone(&sub.callback)))
            .collect();

        for (id, callback) in targets {
            self.deliver(id, &callback, &record);
        }

        record
    }

    fn deliver(&self, id: SubscriptionId, callback: &EventCallback, record: &EventRecord) {
        match catch_unwind(AssertUnwindSafe(|| callback(record))) {
            Ok(Ok(())) => {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                if let Some(sub) = self.inner.subscriptions.write().get_mut(&id) {
                    sub.delivered += 1;
                }
            }
            Ok(Err(e)) => {
                self.inner.delivery_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subscription = %id, event = %record.id, error = %e, "Subscriber failed");
            }
            Err(_) => {
                self.inner.delivery_failures.fetch_add(1, Ordering::Relaxed);
                error!(subscription = %id, event = %record.id, "Subscriber panicked");
            }
        }
    }
}

// ============================================================================
// EventBus - Subscriptions
// ============================================================================

impl EventBus {
    /// Registers a subscription.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        owner: Option<ConnectionId>,
        callback: EventCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId::generate();
        self.inner.subscriptions.write().insert(
            id,
            Subscription {
                filter,
                callback,
                active: true,
                owner,
                delivered: 0,
            },
        );
        debug!(subscription = %id, ?owner, "Subscription added");
        id
    }

    /// Removes a subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscriptions.write().remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "Subscription removed");
        }
        removed
    }

    /// Suspends delivery to a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] if the subscription does not exist.
    pub fn pause(&self, id: SubscriptionId) -> Result<()> {
        self.set_active(id, false)
    }

    /// Resumes delivery to a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] if the subscription does not exist.
    pub fn resume(&self, id: SubscriptionId) -> Result<()> {
        self.set_active(id, true)
    }

    fn set_active(&self, id: SubscriptionId, active: bool) -> Result<()> {
        let mut subs = self.inner.subscriptions.write();
        let sub = subs
            .get_mut(&id)
            .ok_or_else(|| Error::invalid_params(format!("Unknown subscription: {id}")))?;
        sub.active = active;
        Ok(())
    }

    /// Removes every subscription owned by `owner`. Returns how many were removed.
    pub fn remove_by_owner(&self, owner: ConnectionId) -> usize {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|_, sub| sub.owner != Some(owner));
        let removed = before - subs.len();
        if removed > 0 {
            debug!(connection = %owner, removed, "Owned subscriptions removed");
        }
        removed
    }

    /// Returns the number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Returns a snapshot of one subscription.
    #[must_use]
    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.inner
            .subscriptions
            .read()
            .get(&id)
            .map(|sub| SubscriptionInfo {
                id,
                filter: sub.filter.clone(),
                active: sub.active,
                owner: sub.owner,
                delivered: sub.delivered,
            })
    }
}

// ============================================================================
// EventBus - Queries
// ============================================================================

impl EventBus {
    /// Returns matching records, newest first.
    ///
    /// Single-type or single-category filters are answered from the
    /// secondary index; anything else scans history from the newest end.
    #[must_use]
    pub fn query_events(&self, query: &EventQuery) -> Vec<EventRecord> {
        let history = self.inner.history.read();
        let filter = &query.filter;

        if let Some(event_type) = filter.single_type() {
            return history
                .by_type
                .get(event_type)
                .map(|seqs| history.newest(seqs.iter(), filter, query.limit))
                .unwrap_or_default();
        }

        if let Some(category) = filter.single_category() {
            return history
                .by_category
                .get(&category)
                .map(|seqs| history.newest(seqs.iter(), filter, query.limit))
                .unwrap_or_default();
        }

        history.newest(history.records.keys(), filter, query.limit)
    }

    /// Returns records of one type, newest first.
    #[must_use]
    pub fn get_events_by_type(&self, event_type: &str, limit: usize) -> Vec<EventRecord> {
        let history = self.inner.history.read();
        let all = EventFilter::all();
        history
            .by_type
            .get(event_type)
            .map(|seqs| history.newest(seqs.iter(), &all, limit))
            .unwrap_or_default()
    }

    /// Returns records of one category, newest first.
    #[must_use]
    pub fn get_events_by_category(&self, category: EventCategory, limit: usize) -> Vec<EventRecord> {
        let history = self.inner.history.read();
        let all = EventFilter::all();
        history
            .by_category
            .get(&category)
            .map(|seqs| history.newest(seqs.iter(), &all, limit))
            .unwrap_or_default()
    }

    /// Returns records with exactly this source, newest first.
    #[must_use]
    pub fn get_events_by_source(&self, source: &EventSource, limit: usize) -> Vec<EventRecord> {
        let history = self.inner.history.read();
        let all = EventFilter::all();
        history
            .by_source
            .get(&source.key())
            .map(|seqs| history.newest(seqs.iter(), &all, limit))
            .unwrap_or_default()
    }

    /// Returns the most recent records, newest first.
    #[must_use]
    pub fn get_recent_events(&self, limit: usize) -> Vec<EventRecord> {
        let history = self.inner.history.read();
        history
            .records
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Looks up a record by id.
    #[must_use]
    pub fn get_event(&self, id: EventId) -> Option<EventRecord> {
        let history = self.inner.history.read();
        history
            .by_id
            .get(&id)
            .and_then(|seq| history.records.get(seq))
            .cloned()
    }

    /// Returns the number of records in history.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner.history.read().records.len()
    }

    /// Returns bus counters.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            delivery_failures: self.inner.delivery_failures.load(Ordering::Relaxed),
            history_size: self.history_len(),
            subscriptions: self.subscription_count(),
        }
    }
}

// ============================================================================
// EventBus - Maintenance
// ============================================================================

impl EventBus {
    /// Drops records older than the configured maximum age.
    pub fn prune_expired(&self) -> usize {
        let Some(max_age) = self.inner.config.max_age else {
            return 0;
        };
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let removed = self.inner.history.write().retain_since(Utc::now() - age);
        if removed > 0 {
            debug!(removed, "Expired events pruned");
        }
        removed
    }

    /// Starts the age-based pruning task when a maximum age is configured.
    pub fn start_maintenance(&self) {
        if self.inner.config.max_age.is_none() {
            return;
        }
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn("event-prune", self.inner.config.prune_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        EventBus { inner }.prune_expired();
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            }
        });
        *self.inner.maintenance.lock() = Some(task);
    }

    /// Stops background maintenance and drops every subscription.
    pub async fn shutdown(&self) {
        let task = self.inner.maintenance.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
        self.inner.subscriptions.write().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
