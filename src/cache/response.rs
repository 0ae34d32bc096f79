//! In-memory response cache for idempotent calls.
//!
//! Bounded by a byte budget and an entry count. Both bounds hold after every
//! mutating operation: `set` evicts least-recently-used entries until the new
//! entry fits before inserting it, and refuses values larger than the whole
//! budget.
//!
//! Values are cloned on the way in and on the way out, so callers never share
//! memory with a cached entry.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::periodic::PeriodicTask;

// ============================================================================
// Constants
// ============================================================================

/// Width of a timestamp bucket in the secondary time index.
const BUCKET_WIDTH: Duration = Duration::from_secs(60);

// ============================================================================
// CacheEntry
// ============================================================================

/// One cached value plus bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created: Instant,
    ttl: Duration,
    access_count: u64,
    last_access: Instant,
    /// Monotonic access stamp; the smallest stamp is evicted first.
    access_seq: u64,
    size: usize,
    tags: Vec<String>,
    bucket: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.created + self.ttl
    }
}

/// Public view of an entry's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Entry key.
    pub key: String,
    /// Number of hits served.
    pub access_count: u64,
    /// Estimated size in bytes.
    pub size: usize,
    /// Remaining lifetime.
    pub ttl_remaining: Duration,
    /// Tags attached on insert.
    pub tags: Vec<String>,
}

// ============================================================================
// CacheStats
// ============================================================================

/// Response cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Estimated bytes held.
    pub bytes: usize,
    /// Byte budget.
    pub max_bytes: usize,
    /// Entry budget.
    pub max_entries: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups.
    pub misses: u64,
    /// Inserts.
    pub sets: u64,
    /// Explicit deletions.
    pub deletes: u64,
    /// Entries removed to respect a budget.
    pub evictions: u64,
    /// Entries removed because their TTL ran out.
    pub expirations: u64,
    /// `hits / (hits + misses)`, or 0 with no lookups.
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

// ============================================================================
// CacheState
// ============================================================================

/// Primary map plus the tag and time-bucket indices.
#[derive(Default)]
struct CacheState {
    entries: FxHashMap<String, CacheEntry>,
    total_bytes: usize,
    by_tag: FxHashMap<String, FxHashSet<String>>,
    by_bucket: BTreeMap<u64, FxHashSet<String>>,
    next_seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        for tag in &entry.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.by_bucket
            .entry(entry.bucket)
            .or_default()
            .insert(key.clone());
        self.total_bytes += entry.size;
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size;
        for tag in &entry.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        if let Some(keys) = self.by_bucket.get_mut(&entry.bucket) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_bucket.remove(&entry.bucket);
            }
        }
        Some(entry)
    }

    fn least_recently_used(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.access_seq)
            .map(|(k, _)| k.clone())
    }

    fn expired_keys(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

// ============================================================================
// ResponseCache
// ============================================================================

/// Byte- and count-bounded LRU cache with TTL expiry and tag invalidation.
pub struct ResponseCache {
    config: CacheConfig,
    epoch: Instant,
    state: Mutex<CacheState>,
    counters: Counters,
    cleanup: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResponseCache")
            .field("entries", &state.entries.len())
            .field("bytes", &state.total_bytes)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            state: Mutex::new(CacheState::default()),
            counters: Counters::default(),
            cleanup: Mutex::new(None),
        }
    }

    /// Approximate in-memory footprint of a value under `key`.
    #[must_use]
    pub fn estimate_size(key: &str, value: &Value) -> usize {
        key.len() + value.to_string().len()
    }

    fn bucket_of(&self, at: Instant) -> u64 {
        at.duration_since(self.epoch).as_secs() / BUCKET_WIDTH.as_secs()
    }
}

// ============================================================================
// ResponseCache - Core operations
// ============================================================================

impl ResponseCache {
    /// Stores a copy of `value` under `key`.
    ///
    /// Uses the configured default TTL when `ttl` is `None`. Returns `false`
    /// without storing anything if the value alone exceeds the byte budget.
    pub fn set(&self, key: &str, value: &Value, ttl: Option<Duration>, tags: &[String]) -> bool {
        let size = Self::estimate_size(key, value);
        if size > self.config.max_bytes {
            debug!(key, size, max = self.config.max_bytes, "Value exceeds cache budget");
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.remove(key);

        while !state.entries.is_empty()
            && (state.total_bytes + size > self.config.max_bytes
                || state.entries.len() + 1 > self.config.max_entries)
        {
            let Some(victim) = state.least_recently_used() else {
                break;
            };
            state.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(key = %victim, "Evicted least recently used entry");
        }

        let seq = state.next_seq();
        let entry = CacheEntry {
            value: value.clone(),
            created: now,
            ttl: ttl.unwrap_or(self.config.default_ttl),
            access_count: 0,
            last_access: now,
            access_seq: seq,
            size,
            tags: tags.to_vec(),
            bucket: self.bucket_of(now),
        };
        state.insert(key.to_string(), entry);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Returns a copy of the value under `key` if present and not expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let seq = state.next_seq();
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = now;
        entry.access_seq = seq;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Returns `true` if a live entry exists, without touching LRU order.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Removes one entry. Returns `true` if it existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes every entry carrying `tag`. Returns how many were removed.
    pub fn delete_by_tag(&self, tag: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            state.remove(key);
        }
        self.counters
            .deletes
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        if !keys.is_empty() {
            debug!(tag, removed = keys.len(), "Cache entries invalidated by tag");
        }
        keys.len()
    }

    /// Removes every entry whose key matches the regular expression `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] if `pattern` is not a valid regex.
    pub fn delete_by_pattern(&self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::invalid_params(format!("Invalid key pattern: {e}")))?;
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| regex.is_match(k))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        self.counters
            .deletes
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(keys.len())
    }

    /// Removes everything.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let count = state.entries.len();
        *state = CacheState {
            next_seq: state.next_seq,
            ..CacheState::default()
        };
        debug!(count, "Response cache cleared");
    }
}

// ============================================================================
// ResponseCache - Inspection
// ============================================================================

impl ResponseCache {
    /// Keys of live entries.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of stored entries, including ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated bytes currently held.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Metadata for one entry.
    #[must_use]
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = Instant::now();
        self.state.lock().entries.get(key).map(|e| EntryInfo {
            key: key.to_string(),
            access_count: e.access_count,
            size: e.size,
            ttl_remaining: (e.created + e.ttl).saturating_duration_since(now),
            tags: e.tags.clone(),
        })
    }

    /// Keys of entries created at least `age` ago, by coarse time bucket.
    #[must_use]
    pub fn entries_older_than(&self, age: Duration) -> Vec<String> {
        let Some(cutoff) = Instant::now().checked_sub(age) else {
            return Vec::new();
        };
        let cutoff_bucket = self.bucket_of(cutoff.max(self.epoch));
        let state = self.state.lock();
        state
            .by_bucket
            .range(..cutoff_bucket)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Returns cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let state = self.state.lock();
            (state.entries.len(), state.total_bytes)
        };
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries,
            bytes,
            max_bytes: self.config.max_bytes,
            max_entries: self.config.max_entries,
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

// ============================================================================
// ResponseCache - Maintenance
// ============================================================================

impl ResponseCache {
    /// Removes expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired = state.expired_keys(now);
        for key in &expired {
            state.remove(key);
        }
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Expired cache entries swept");
        }
        expired.len()
    }

    /// Starts the periodic expired-entry sweep.
    pub fn start_cleanup(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("cache-cleanup", self.config.cleanup_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(cache) => {
                        cache.cleanup_expired();
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            }
        });
        *self.cleanup.lock() = Some(task);
    }

    /// Stops the periodic sweep.
    pub async fn shutdown(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    fn cache(max_bytes: usize, max_entries: usize) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            max_bytes,
            max_entries,
            ..CacheConfig::default()
        })
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_get_returns_equal_copy() {
        let cache = cache(10_000, 10);
        let mut value = json!({ "title": "Example", "nested": { "n": [1, 2, 3] } });
        assert!(cache.set("k", &value, None, &[]));

        value["title"] = json!("mutated");
        let hit = cache.get("k").expect("hit");
        assert_eq!(hit["title"], "Example");
        assert_eq!(hit["nested"]["n"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = cache(10_000, 10);
        let value = json!({ "url": "https://example.com" });
        cache.set("k", &value, Some(Duration::from_millis(100)), &[]);

        assert_eq!(cache.get("k"), Some(value));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k"), None);
        assert!(!cache.keys().contains(&"k".to_string()));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_lru_eviction_respects_access() {
        let value = json!("0123456789");
        let one = ResponseCache::estimate_size("a", &value);
        let cache = cache(one * 3, 100);

        cache.set("a", &value, None, &[]);
        cache.set("b", &value, None, &[]);
        cache.set("c", &value, None, &[]);

        // Touch "a" so "b" becomes the oldest.
        assert!(cache.get("a").is_some());
        cache.set("d", &value, None, &[]);

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_entry_cap() {
        let cache = cache(1_000_000, 2);
        cache.set("a", &json!(1), None, &[]);
        cache.set("b", &json!(2), None, &[]);
        cache.set("c", &json!(3), None, &[]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.has("a"));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let cache = cache(16, 10);
        assert!(!cache.set("big", &json!("x".repeat(64)), None, &[]));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reset_existing_key_replaces_size() {
        let cache = cache(10_000, 10);
        cache.set("k", &json!("short"), None, &[]);
        cache.set("k", &json!("a much longer value"), None, &[]);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.total_bytes(),
            ResponseCache::estimate_size("k", &json!("a much longer value"))
        );
    }

    #[test]
    fn test_delete_by_tag_and_pattern() {
        let cache = cache(10_000, 10);
        cache.set("current-url:1", &json!("a"), None, &tags(&["page:p1"]));
        cache.set("current-title:1", &json!("b"), None, &tags(&["page:p1", "tool:current-title"]));
        cache.set("version:1", &json!("c"), None, &tags(&["tool:version"]));

        assert_eq!(cache.delete_by_tag("page:p1"), 2);
        assert_eq!(cache.delete_by_tag("page:p1"), 0);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.delete_by_pattern("^version:").expect("valid"), 1);
        assert!(cache.is_empty());
        assert!(cache.delete_by_pattern("(").is_err());
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = cache(10_000, 10);
        cache.set("k", &json!(1), None, &[]);
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_and_time_buckets() {
        let cache = cache(10_000, 10);
        cache.set("old", &json!(1), Some(Duration::from_secs(30)), &[]);
        tokio::time::advance(Duration::from_secs(120)).await;
        cache.set("new", &json!(2), Some(Duration::from_secs(300)), &[]);

        assert_eq!(cache.entries_older_than(Duration::from_secs(60)), vec!["old".to_string()]);
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.keys(), vec!["new".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cleanup() {
        let cache = Arc::new(ResponseCache::new(CacheConfig {
            cleanup_interval: Duration::from_secs(1),
            ..CacheConfig::default()
        }));
        cache.set("k", &json!(1), Some(Duration::from_millis(500)), &[]);
        cache.start_cleanup();

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(cache.is_empty());
        cache.shutdown().await;
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, usize),
        Get(u8),
        Delete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), 0usize..400).prop_map(|(k, n)| Op::Set(k % 32, n)),
            any::<u8>().prop_map(|k| Op::Get(k % 32)),
            any::<u8>().prop_map(|k| Op::Delete(k % 32)),
        ]
    }

    proptest! {
        #[test]
        fn prop_budgets_hold_after_every_op(ops in proptest::collection::vec(op(), 1..200)) {
            let cache = cache(2_048, 8);
            for op in ops {
                match op {
                    Op::Set(k, n) => { cache.set(&format!("key-{k}"), &json!("x".repeat(n)), None, &[]); }
                    Op::Get(k) => { cache.get(&format!("key-{k}")); }
                    Op::Delete(k) => { cache.delete(&format!("key-{k}")); }
                }
                prop_assert!(cache.total_bytes() <= 2_048);
                prop_assert!(cache.len() <= 8);
            }
        }
    }
}
