//! Durable session-state cache.
//!
//! Stores per-session state blobs (cookies, storage snapshots, page lists)
//! keyed by the `(session, type)` pair. Every entry carries a SHA-256 checksum of its
//! serialized state that is re-verified on read, from memory and from disk
//! alike. Persistent entries are mirrored under `<storage_dir>/sessions/`
//! and survive restarts; named backups live under `<storage_dir>/backups/`.
//!
//! # Layout
//!
//! ```text
//! <storage_dir>/
//! ├── sessions/<sha256 of the pair>.json
//! └── backups/<name>.json
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::SessionCacheConfig;
use crate::error::{Error, Result};
use crate::periodic::PeriodicTask;

// ============================================================================
// Constants
// ============================================================================

const SESSIONS_DIR: &str = "sessions";
const BACKUPS_DIR: &str = "backups";

// ============================================================================
// SessionEntry
// ============================================================================

/// One stored state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Owning session.
    pub session_id: String,
    /// Kind of state, e.g. `cookies`.
    pub state_type: String,
    /// The state itself.
    pub state: Value,
    /// Lowercase hex SHA-256 of the serialized state.
    pub checksum: String,
    /// Serialized size in bytes.
    pub size: usize,
    /// Whether the entry is mirrored to disk and exempt from memory eviction.
    pub persistent: bool,
    /// First write.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl SessionEntry {
    /// Returns `true` if the stored checksum matches the state.
    #[must_use]
    pub fn verify(&self) -> bool {
        checksum_of(&self.state).is_ok_and(|(sum, _)| sum == self.checksum)
    }

    /// Returns `true` if the entry belongs to `(session_id, state_type)`.
    #[must_use]
    pub fn is_for(&self, session_id: &str, state_type: &str) -> bool {
        self.session_id == session_id && self.state_type == state_type
    }

    fn key(&self) -> EntryKey {
        (self.session_id.clone(), self.state_type.clone())
    }
}

/// Summary row returned by [`SessionCache::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Kind of state.
    pub state_type: String,
    /// Serialized size in bytes.
    pub size: usize,
    /// Whether the entry is persistent.
    pub persistent: bool,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// Metadata for a named backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Backup name.
    pub name: String,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// Number of entries captured.
    pub entries: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupFile {
    #[serde(flatten)]
    info: BackupInfo,
    sessions: Vec<SessionEntry>,
}

/// Session cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCacheStats {
    /// Entries held in memory.
    pub memory_entries: usize,
    /// Reads served from memory.
    pub memory_hits: u64,
    /// Reads served from disk.
    pub disk_hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Entries discarded because their checksum failed.
    pub corrupted: u64,
    /// Non-persistent entries dropped for the memory cap.
    pub evictions: u64,
}

/// `(session_id, state_type)`.
type EntryKey = (String, String);

/// In-memory slot; `seq` orders writes for eviction.
struct Slot {
    entry: SessionEntry,
    seq: u64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    corrupted: AtomicU64,
    evictions: AtomicU64,
}

// ============================================================================
// Helpers
// ============================================================================

fn entry_key(session_id: &str, state_type: &str) -> EntryKey {
    (session_id.to_string(), state_type.to_string())
}

fn checksum_of(state: &Value) -> Result<(String, usize)> {
    let bytes = serde_json::to_vec(state)?;
    let digest = Sha256::digest(&bytes);
    Ok((format!("{digest:x}"), bytes.len()))
}

/// File-system-safe stem, distinct for every `(session, type)` pair.
///
/// Each part is length-prefixed so no two pairs hash the same input.
fn file_stem(session_id: &str, state_type: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [session_id, state_type] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn sanitize_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && name != "."
        && name != "..";
    if valid {
        Ok(name)
    } else {
        Err(Error::invalid_params(format!("Invalid backup name: {name:?}")))
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// SessionCache
// ============================================================================

/// Checksum-validated session-state store with an optional disk mirror.
pub struct SessionCache {
    config: SessionCacheConfig,
    memory: Mutex<FxHashMap<EntryKey, Slot>>,
    write_seq: AtomicU64,
    counters: Counters,
    cleanup: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("storage_dir", &self.config.storage_dir)
            .field("memory_entries", &self.memory.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionCache {
    /// Creates a cache. Nothing touches disk until the first persistent write.
    #[must_use]
    pub fn new(config: SessionCacheConfig) -> Self {
        Self {
            config,
            memory: Mutex::new(FxHashMap::default()),
            write_seq: AtomicU64::new(0),
            counters: Counters::default(),
            cleanup: Mutex::new(None),
        }
    }

    /// Root of durable storage, if configured.
    #[inline]
    #[must_use]
    pub fn storage_dir(&self) -> Option<&Path> {
        self.config.storage_dir.as_deref()
    }

    fn session_path(&self, session_id: &str, state_type: &str) -> Option<PathBuf> {
        self.storage_dir().map(|dir| {
            dir.join(SESSIONS_DIR)
                .join(format!("{}.json", file_stem(session_id, state_type)))
        })
    }

    fn backup_dir(&self) -> Result<PathBuf> {
        self.storage_dir()
            .map(|dir| dir.join(BACKUPS_DIR))
            .ok_or_else(|| Error::config("Session backups require a storage directory"))
    }
}

// ============================================================================
// SessionCache - Read / Write
// ============================================================================

impl SessionCache {
    /// Stores `state` for `(session_id, state_type)`.
    ///
    /// Persistent entries are also written to disk when a storage directory
    /// is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the disk write fails.
    pub async fn set(
        &self,
        session_id: &str,
        state_type: &str,
        state: &Value,
        persistent: bool,
    ) -> Result<()> {
        let key = entry_key(session_id, state_type);
        let (checksum, size) = checksum_of(state)?;
        let now = Utc::now();

        let entry = {
            let mut memory = self.memory.lock();
            let created_at = memory.get(&key).map_or(now, |s| s.entry.created_at);
            let entry = SessionEntry {
                session_id: session_id.to_string(),
                state_type: state_type.to_string(),
                state: state.clone(),
                checksum,
                size,
                persistent,
                created_at,
                updated_at: now,
            };
            self.insert_slot(&mut memory, entry.clone());
            entry
        };

        if let Some(path) = self.session_path(session_id, state_type) {
            if persistent {
                write_json(&path, &entry).await?;
            } else {
                remove_if_exists(&path).await?;
            }
        }

        debug!(session_id, state_type, size, persistent, "Session state stored");
        Ok(())
    }

    fn insert_slot(&self, memory: &mut FxHashMap<EntryKey, Slot>, entry: SessionEntry) {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        memory.insert(entry.key(), Slot { entry, seq });
        self.enforce_memory_cap(memory);
    }

    fn enforce_memory_cap(&self, memory: &mut FxHashMap<EntryKey, Slot>) {
        while memory.len() > self.config.max_memory_entries {
            let victim = memory
                .iter()
                .filter(|(_, s)| !s.entry.persistent)
                .min_by_key(|(_, s)| s.seq)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            memory.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reads state for `(session_id, state_type)`.
    ///
    /// Falls through to disk on a memory miss. An entry whose checksum fails
    /// is deleted and reported as a miss. A file recording a different pair
    /// than the one requested is never served.
    ///
    /// # Errors
    ///
    /// Returns an error only for disk failures other than a missing file.
    pub async fn get(&self, session_id: &str, state_type: &str) -> Result<Option<Value>> {
        let key = entry_key(session_id, state_type);

        let cached = self.memory.lock().get(&key).map(|s| s.entry.clone());
        if let Some(entry) = cached {
            if entry.verify() {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.state));
            }
            warn!(session_id, state_type, "Session entry failed checksum; discarding");
            self.discard(session_id, state_type).await?;
            return Ok(None);
        }

        let Some(path) = self.session_path(session_id, state_type) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<SessionEntry>(&bytes) {
            Ok(entry) if !entry.is_for(session_id, state_type) => {
                warn!(
                    session_id,
                    state_type,
                    stored_session = %entry.session_id,
                    stored_type = %entry.state_type,
                    path = %path.display(),
                    "Stored session file belongs to another entry; ignoring"
                );
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Ok(entry) if entry.verify() => {
                let state = entry.state.clone();
                self.insert_slot(&mut self.memory.lock(), entry);
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(state))
            }
            _ => {
                warn!(session_id, state_type, path = %path.display(), "Stored session file is corrupt; discarding");
                self.discard(session_id, state_type).await?;
                Ok(None)
            }
        }
    }

    async fn discard(&self, session_id: &str, state_type: &str) -> Result<()> {
        self.memory.lock().remove(&entry_key(session_id, state_type));
        self.counters.corrupted.fetch_add(1, Ordering::Relaxed);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(path) = self.session_path(session_id, state_type) {
            remove_if_exists(&path).await?;
        }
        Ok(())
    }

    /// Deletes one entry from memory and disk. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk removal fails.
    pub async fn delete(&self, session_id: &str, state_type: &str) -> Result<bool> {
        let mut existed = self
            .memory
            .lock()
            .remove(&entry_key(session_id, state_type))
            .is_some();
        if let Some(path) = self.session_path(session_id, state_type) {
            existed |= fs::try_exists(&path).await?;
            remove_if_exists(&path).await?;
        }
        Ok(existed)
    }

    /// Deletes every entry belonging to `session_id`. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if a disk removal fails.
    pub async fn delete_session(&self, session_id: &str) -> Result<usize> {
        let types: Vec<String> = self
            .list(session_id)
            .await?
            .into_iter()
            .map(|s| s.state_type)
            .collect();
        let mut removed = 0;
        for state_type in types {
            if self.delete(session_id, &state_type).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Lists entries for `session_id` from memory and disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the sessions directory cannot be read.
    pub async fn list(&self, session_id: &str) -> Result<Vec<SessionSummary>> {
        let mut found: FxHashMap<String, SessionSummary> = FxHashMap::default();

        for entry in self.load_disk_entries().await? {
            if entry.session_id == session_id {
                found.insert(entry.state_type.clone(), summary(&entry));
            }
        }
        for slot in self.memory.lock().values() {
            if slot.entry.session_id == session_id {
                found.insert(slot.entry.state_type.clone(), summary(&slot.entry));
            }
        }

        let mut list: Vec<SessionSummary> = found.into_values().collect();
        list.sort_by(|a, b| a.state_type.cmp(&b.state_type));
        Ok(list)
    }

    async fn load_disk_entries(&self) -> Result<Vec<SessionEntry>> {
        let Some(dir) = self.storage_dir().map(|d| d.join(SESSIONS_DIR)) else {
            return Ok(Vec::new());
        };
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            match serde_json::from_slice::<SessionEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }
        Ok(entries)
    }

    /// Returns cache counters.
    #[must_use]
    pub fn stats(&self) -> SessionCacheStats {
        SessionCacheStats {
            memory_entries: self.memory.lock().len(),
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            corrupted: self.counters.corrupted.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

fn summary(entry: &SessionEntry) -> SessionSummary {
    SessionSummary {
        state_type: entry.state_type.clone(),
        size: entry.size,
        persistent: entry.persistent,
        updated_at: entry.updated_at,
    }
}

// ============================================================================
// SessionCache - Backups
// ============================================================================

impl SessionCache {
    /// Writes every known entry into a named backup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] without a storage directory,
    /// [`Error::InvalidParams`] for an unsafe name, or an IO error.
    pub async fn backup(&self, name: &str) -> Result<BackupInfo> {
        let name = sanitize_name(name)?;
        let dir = self.backup_dir()?;

        let mut all: FxHashMap<EntryKey, SessionEntry> = self
            .load_disk_entries()
            .await?
            .into_iter()
            .map(|e| (e.key(), e))
            .collect();
        for (key, slot) in self.memory.lock().iter() {
            all.insert(key.clone(), slot.entry.clone());
        }

        let mut sessions: Vec<SessionEntry> = all.into_values().collect();
        sessions.sort_by(|a, b| {
            (&a.session_id, &a.state_type).cmp(&(&b.session_id, &b.state_type))
        });

        let info = BackupInfo {
            name: name.to_string(),
            created_at: Utc::now(),
            entries: sessions.len(),
        };
        write_json(&dir.join(format!("{name}.json")), &BackupFile {
            info: info.clone(),
            sessions,
        })
        .await?;

        info!(backup = name, entries = info.entries, "Session backup written");
        Ok(info)
    }

    /// Restores a named backup into memory and disk. Returns entries restored.
    ///
    /// Entries whose checksum fails are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackupNotFound`] if no such backup exists.
    pub async fn restore(&self, name: &str) -> Result<usize> {
        let name = sanitize_name(name)?;
        let path = self.backup_dir()?.join(format!("{name}.json"));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BackupNotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let file: BackupFile = serde_json::from_slice(&bytes)?;

        let mut restored = 0;
        for entry in file.sessions {
            if !entry.verify() {
                warn!(
                    session_id = %entry.session_id,
                    state_type = %entry.state_type,
                    backup = name,
                    "Skipping corrupt backup entry"
                );
                continue;
            }
            if entry.persistent
                && let Some(path) = self.session_path(&entry.session_id, &entry.state_type)
            {
                write_json(&path, &entry).await?;
            }
            self.insert_slot(&mut self.memory.lock(), entry);
            restored += 1;
        }

        info!(backup = name, restored, "Session backup restored");
        Ok(restored)
    }

    /// Lists available backups, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] without a storage directory.
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let dir = self.backup_dir()?;
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Ok(bytes) = fs::read(&path).await
                && let Ok(file) = serde_json::from_slice::<BackupFile>(&bytes)
            {
                backups.push(file.info);
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }
}

// ============================================================================
// SessionCache - Maintenance
// ============================================================================

impl SessionCache {
    /// Removes non-persistent entries older than the configured max age.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk sweep fails.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(self.config.max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let mut removed = {
            let mut memory = self.memory.lock();
            let before = memory.len();
            memory.retain(|_, s| s.entry.persistent || s.entry.updated_at >= cutoff);
            before - memory.len()
        };

        for entry in self.load_disk_entries().await? {
            if !entry.persistent
                && entry.updated_at < cutoff
                && let Some(path) = self.session_path(&entry.session_id, &entry.state_type)
            {
                remove_if_exists(&path).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Expired session entries swept");
        }
        Ok(removed)
    }

    /// Starts the periodic age sweep.
    pub fn start_cleanup(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("session-cleanup", self.config.cleanup_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(cache) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                if let Err(e) = cache.cleanup_expired().await {
                    warn!(error = %e, "Session cleanup failed");
                }
                ControlFlow::Continue(())
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

    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir) -> SessionCache {
        SessionCache::new(SessionCacheConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..SessionCacheConfig::default()
        })
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let cache = SessionCache::new(SessionCacheConfig::default());
        let cookies = json!([{ "name": "sid", "value": "abc" }]);
        cache.set("s1", "cookies", &cookies, false).await.expect("set");

        assert_eq!(cache.get("s1", "cookies").await.expect("get"), Some(cookies));
        assert_eq!(cache.get("s1", "storage").await.expect("get"), None);
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_persistent_entry_survives_restart() {
        let dir = TempDir::new().expect("tempdir");
        let state = json!({ "pages": ["https://example.com"] });

        cache_in(&dir).set("s1", "pages", &state, true).await.expect("set");

        let reopened = cache_in(&dir);
        assert_eq!(reopened.get("s1", "pages").await.expect("get"), Some(state));
        assert_eq!(reopened.stats().disk_hits, 1);
        assert!(reopened.session_path("s1", "pages").is_some_and(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_non_persistent_not_written() {
        let dir = TempDir::new().expect("tempdir");
        cache_in(&dir).set("s1", "scratch", &json!(1), false).await.expect("set");
        assert_eq!(cache_in(&dir).get("s1", "scratch").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_corrupt_memory_entry_is_a_miss() {
        let cache = SessionCache::new(SessionCacheConfig::default());
        cache.set("s1", "cookies", &json!({ "a": 1 }), false).await.expect("set");

        if let Some(slot) = cache.memory.lock().get_mut(&entry_key("s1", "cookies")) {
            slot.entry.state = json!({ "a": 2 });
        }

        assert_eq!(cache.get("s1", "cookies").await.expect("get"), None);
        assert_eq!(cache.stats().corrupted, 1);
        assert_eq!(cache.stats().memory_entries, 0);
    }

    #[tokio::test]
    async fn test_corrupt_disk_entry_is_deleted() {
        let dir = TempDir::new().expect("tempdir");
        cache_in(&dir).set("s1", "cookies", &json!({ "a": 1 }), true).await.expect("set");

        let path = cache_in(&dir).session_path("s1", "cookies").expect("storage dir");
        let mut entry: SessionEntry =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("parse");
        entry.state = json!({ "a": "tampered" });
        std::fs::write(&path, serde_json::to_vec(&entry).expect("encode")).expect("write");

        let reopened = cache_in(&dir);
        assert_eq!(reopened.get("s1", "cookies").await.expect("get"), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_memory_cap_spares_persistent_entries() {
        let dir = TempDir::new().expect("tempdir");
        let cache = SessionCache::new(SessionCacheConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            max_memory_entries: 2,
            ..SessionCacheConfig::default()
        });

        cache.set("s1", "keep", &json!(1), true).await.expect("set");
        cache.set("s1", "a", &json!(2), false).await.expect("set");
        cache.set("s1", "b", &json!(3), false).await.expect("set");

        let memory = cache.memory.lock();
        assert_eq!(memory.len(), 2);
        assert!(memory.contains_key(&entry_key("s1", "keep")));
        assert!(memory.contains_key(&entry_key("s1", "b")));
    }

    #[tokio::test]
    async fn test_separator_in_ids_does_not_alias() {
        let cache = SessionCache::new(SessionCacheConfig::default());
        cache.set("a:b", "c", &json!("first"), false).await.expect("set");

        assert_eq!(cache.get("a", "b:c").await.expect("get"), None);
        assert_eq!(cache.get("a:b", "c").await.expect("get"), Some(json!("first")));
    }

    #[tokio::test]
    async fn test_unsafe_characters_get_distinct_files() {
        let dir = TempDir::new().expect("tempdir");
        cache_in(&dir)
            .set("alice/x", "cookies", &json!("alice-secret"), true)
            .await
            .expect("set");

        let reopened = cache_in(&dir);
        assert_eq!(reopened.get("alice?x", "cookies").await.expect("get"), None);
        assert_eq!(
            reopened.get("alice/x", "cookies").await.expect("get"),
            Some(json!("alice-secret"))
        );
        assert_ne!(file_stem("alice/x", "cookies"), file_stem("alice?x", "cookies"));
        assert_ne!(file_stem("a", "bc"), file_stem("ab", "c"));
    }

    #[tokio::test]
    async fn test_file_for_another_pair_is_not_served() {
        let dir = TempDir::new().expect("tempdir");
        let cache = cache_in(&dir);
        cache.set("bob", "cookies", &json!("bob-secret"), true).await.expect("set");

        let bob = cache.session_path("bob", "cookies").expect("storage dir");
        let eve = cache.session_path("eve", "cookies").expect("storage dir");
        std::fs::copy(&bob, &eve).expect("copy");

        let reopened = cache_in(&dir);
        assert_eq!(reopened.get("eve", "cookies").await.expect("get"), None);
        assert_eq!(reopened.stats().memory_entries, 0);
        assert!(bob.exists());
    }

    #[tokio::test]
    async fn test_list_and_delete_session() {
        let dir = TempDir::new().expect("tempdir");
        let cache = cache_in(&dir);
        cache.set("s1", "cookies", &json!([]), true).await.expect("set");
        cache.set("s1", "storage", &json!({}), false).await.expect("set");
        cache.set("s2", "cookies", &json!([]), true).await.expect("set");

        let list = cache.list("s1").await.expect("list");
        let types: Vec<&str> = list.iter().map(|s| s.state_type.as_str()).collect();
        assert_eq!(types, ["cookies", "storage"]);

        assert_eq!(cache.delete_session("s1").await.expect("delete"), 2);
        assert!(cache.list("s1").await.expect("list").is_empty());
        assert_eq!(cache.list("s2").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let dir = TempDir::new().expect("tempdir");
        let cache = cache_in(&dir);
        cache.set("s1", "cookies", &json!([{ "name": "sid" }]), true).await.expect("set");
        cache.set("s1", "scratch", &json!(42), false).await.expect("set");

        let info = cache.backup("nightly").await.expect("backup");
        assert_eq!(info.entries, 2);

        cache.delete_session("s1").await.expect("delete");
        assert_eq!(cache.get("s1", "cookies").await.expect("get"), None);

        assert_eq!(cache.restore("nightly").await.expect("restore"), 2);
        assert_eq!(cache.get("s1", "scratch").await.expect("get"), Some(json!(42)));

        let backups = cache.list_backups().await.expect("list");
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].name, "nightly");
    }

    #[tokio::test]
    async fn test_backup_errors() {
        let memory_only = SessionCache::new(SessionCacheConfig::default());
        assert!(matches!(memory_only.backup("x").await, Err(Error::Config { .. })));

        let dir = TempDir::new().expect("tempdir");
        let cache = cache_in(&dir);
        assert!(matches!(cache.restore("missing").await, Err(Error::BackupNotFound { .. })));
        assert!(matches!(cache.backup("../escape").await, Err(Error::InvalidParams { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_expired_keeps_persistent() {
        let cache = SessionCache::new(SessionCacheConfig {
            max_age: Duration::from_millis(10),
            ..SessionCacheConfig::default()
        });
        cache.set("s1", "old", &json!(1), false).await.expect("set");
        cache.set("s1", "pinned", &json!(2), true).await.expect("set");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.cleanup_expired().await.expect("cleanup"), 1);
        assert_eq!(cache.get("s1", "pinned").await.expect("get"), Some(json!(2)));
    }
}
