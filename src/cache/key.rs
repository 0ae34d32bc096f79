//! Cache keys and cacheability policy.
//!
//! A cacheable call is fingerprinted from its name plus its arguments
//! serialized with recursively sorted object keys, hashed with `FxHasher`.
//! Collisions are tolerated: the fingerprint only has to keep ordinary calls
//! apart, it is not a security boundary.

// ============================================================================
// Imports
// ============================================================================

use std::hash::{Hash, Hasher};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHasher};
use serde_json::Value;

// ============================================================================
// Canonical serialization
// ============================================================================

/// Serializes `value` with object keys sorted at every depth.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Derives the cache key for a call.
///
/// Format: `<name>:<16 hex digits>`. Argument key order never changes the
/// result.
#[must_use]
pub fn fingerprint(name: &str, arguments: &Value) -> String {
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    canonical_json(arguments).hash(&mut hasher);
    format!("{name}:{:016x}", hasher.finish())
}

// ============================================================================
// CachePolicy
// ============================================================================

/// Caching rule for one call name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// How long a result stays valid.
    pub ttl: Duration,
}

/// Lookup table from call name to [`CachePolicy`].
///
/// Names absent from the table are never cached.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: FxHashMap<String, CachePolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.set("current-url", Duration::from_secs(5));
        table.set("current-title", Duration::from_secs(10));
        table.set("page-content", Duration::from_secs(30));
        table.set("cookies", Duration::from_secs(60));
        table.set("version", Duration::from_secs(60 * 60));
        table
    }
}

impl PolicyTable {
    /// Table with no cacheable calls.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            policies: FxHashMap::default(),
        }
    }

    /// Adds or replaces the policy for `name`.
    pub fn set(&mut self, name: impl Into<String>, ttl: Duration) {
        self.policies.insert(name.into(), CachePolicy { ttl });
    }

    /// Makes `name` uncacheable.
    pub fn remove(&mut self, name: &str) {
        self.policies.remove(name);
    }

    /// Returns the policy for `name`, if it is cacheable.
    #[must_use]
    pub fn policy(&self, name: &str) -> Option<CachePolicy> {
        self.policies.get(name).copied()
    }

    /// Returns `true` if results of `name` may be cached.
    #[inline]
    #[must_use]
    pub fn is_cacheable(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}

// ============================================================================
// Tests
// ============================================================================
