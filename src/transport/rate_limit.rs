//! Per-connection sliding-window rate limiting.
//!
//! Each connection keeps the timestamps of its accepted requests for the
//! last hour. A request is admitted only if both the 60-second and the
//! 3600-second windows have room.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

// ============================================================================
// Constants
// ============================================================================

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

// ============================================================================
// RateLimiter
// ============================================================================

/// Sliding-window limiter keyed by connection.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<FxHashMap<ConnectionId, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(FxHashMap::default()),
        }
    }

    /// Admits or rejects one request from `connection`.
    ///
    /// An admitted request is counted against both windows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] with the time until the blocking
    /// window frees a slot.
    pub fn check(&self, connection: ConnectionId) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut windows = self.windows.lock();
        let stamps = windows.entry(connection).or_default();

        while stamps
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= HOUR)
        {
            stamps.pop_front();
        }

        let in_minute = stamps
            .iter()
            .rev()
            .take_while(|at| now.duration_since(**at) < MINUTE)
            .count();

        let retry_after = if stamps.len() >= self.config.per_hour {
            Some(
                stamps
                    .front()
                    .map_or(HOUR, |oldest| HOUR - now.duration_since(*oldest)),
            )
        } else if in_minute >= self.config.per_minute {
            // Oldest stamp still inside the minute window.
            Some(
                stamps
                    .get(stamps.len() - in_minute)
                    .map_or(MINUTE, |oldest| MINUTE - now.duration_since(*oldest)),
            )
        } else {
            None
        };

        if let Some(retry_after) = retry_after {
            let retry_after_ms = u64::try_from(retry_after.as_millis().max(1)).unwrap_or(u64::MAX);
            debug!(connection = %connection, retry_after_ms, "Rate limit exceeded");
            return Err(Error::RateLimited {
                connection_id: connection,
                retry_after_ms,
            });
        }

        stamps.push_back(now);
        Ok(())
    }

    /// Drops the windows of a departed connection.
    pub fn remove(&self, connection: ConnectionId) {
        self.windows.lock().remove(&connection);
    }

    /// Number of connections with live windows.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
