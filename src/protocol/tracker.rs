//! In-flight request tracking.
//!
//! Every request being handled has one entry here from dispatch until its
//! [`TrackGuard`] drops. The entry carries a one-shot cancellation channel
//! that the dispatch loop races against the handler and the timeout.
//!
//! Request ids and progress tokens are chosen by clients and only unique per
//! connection, so both tables are keyed by origin and client value together.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{ProgressToken, RequestId};

use super::engine::Origin;

// ============================================================================
// Types
// ============================================================================

/// Lifecycle state of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestState {
    /// Handler still running.
    Pending,
    /// Handler resolved and the response was produced.
    Completed,
    /// Client cancelled before completion.
    Cancelled,
    /// Timeout elapsed before completion.
    TimedOut,
}

/// Last progress reported for a token.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Request the token belongs to.
    pub request_id: RequestId,
    /// Work done so far.
    pub progress: f64,
    /// Total work, if known.
    pub total: Option<f64>,
    /// Status text.
    pub message: Option<String>,
}

/// A request id as seen from one connection.
type RequestKey = (Option<Origin>, RequestId);

/// A progress token as seen from one connection.
type ProgressKey = (Option<Origin>, ProgressToken);

struct Tracked {
    method: String,
    started: Instant,
    state: RequestState,
    cancel: Option<oneshot::Sender<()>>,
    progress_token: Option<ProgressToken>,
}

#[derive(Default)]
struct TrackerInner {
    requests: Mutex<FxHashMap<RequestKey, Tracked>>,
    progress: Mutex<FxHashMap<ProgressKey, ProgressSnapshot>>,
}

impl TrackerInner {
    fn untrack(&self, key: &RequestKey) {
        let removed = self.requests.lock().remove(key);
        if let Some(tracked) = removed {
            if let Some(token) = tracked.progress_token {
                self.progress.lock().remove(&(key.0.clone(), token));
            }
            trace!(
                request_id = %key.1,
                method = %tracked.method,
                state = ?tracked.state,
                elapsed_ms = u64::try_from(tracked.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Request untracked"
            );
        }
    }
}

// ============================================================================
// TrackGuard
// ============================================================================

/// Removes its request from the tracker when dropped.
///
/// Held by the dispatch loop so no exit path can leak an entry.
pub struct TrackGuard {
    inner: Arc<TrackerInner>,
    key: RequestKey,
}

impl TrackGuard {
    /// Tracked request id.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.key.1
    }

    /// Connection the request came from.
    #[must_use]
    pub fn origin(&self) -> Option<&Origin> {
        self.key.0.as_ref()
    }

    /// Records the terminal state before the entry is dropped.
    pub fn finish(&self, state: RequestState) {
        if let Some(tracked) = self.inner.requests.lock().get_mut(&self.key)
            && tracked.state == RequestState::Pending
        {
            tracked.state = state;
            tracked.cancel = None;
        }
    }
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.inner.untrack(&self.key);
    }
}

impl std::fmt::Debug for TrackGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackGuard")
            .field("id", &self.key.1)
            .field("origin", &self.key.0)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RequestTracker
// ============================================================================

/// Table of in-flight requests.
#[derive(Clone, Default)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTracker")
            .field("in_flight", &self.len())
            .finish_non_exhaustive()
    }
}

impl RequestTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a request.
    ///
    /// Returns the guard that untracks on drop and the receiver that fires
    /// when the request is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the same origin already has a
    /// request with this id in flight.
    pub fn track(
        &self,
        id: RequestId,
        method: &str,
        origin: Option<Origin>,
        progress_token: Option<ProgressToken>,
    ) -> Result<(TrackGuard, oneshot::Receiver<()>)> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let key: RequestKey = (origin, id);

        {
            let mut requests = self.inner.requests.lock();
            if requests.contains_key(&key) {
                return Err(Error::invalid_request(format!(
                    "request id {} is already in flight",
                    key.1
                )));
            }
            requests.insert(
                key.clone(),
                Tracked {
                    method: method.to_string(),
                    started: Instant::now(),
                    state: RequestState::Pending,
                    cancel: Some(cancel_tx),
                    progress_token: progress_token.clone(),
                },
            );
        }

        if let Some(token) = progress_token {
            self.inner.progress.lock().insert(
                (key.0.clone(), token),
                ProgressSnapshot {
                    request_id: key.1.clone(),
                    progress: 0.0,
                    total: None,
                    message: None,
                },
            );
        }

        trace!(request_id = %key.1, method, "Request tracked");

        Ok((
            TrackGuard {
                inner: Arc::clone(&self.inner),
                key,
            },
            cancel_rx,
        ))
    }

    /// Cancels a pending request of `origin`.
    ///
    /// Returns `false` if that origin has no such id or it is already
    /// terminal. Requests of other origins are never touched.
    pub fn cancel(&self, origin: Option<&Origin>, id: &RequestId) -> bool {
        let key: RequestKey = (origin.cloned(), id.clone());
        let sender = {
            let mut requests = self.inner.requests.lock();
            match requests.get_mut(&key) {
                Some(tracked) if tracked.state == RequestState::Pending => {
                    tracked.state = RequestState::Cancelled;
                    tracked.cancel.take()
                }
                _ => None,
            }
        };

        match sender {
            Some(tx) => {
                let _ = tx.send(());
                debug!(request_id = %id, "Request cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every pending request that arrived from `origin`.
    pub fn cancel_by_origin(&self, origin: &Origin) -> usize {
        let ids: Vec<RequestId> = self
            .inner
            .requests
            .lock()
            .iter()
            .filter(|((o, _), t)| t.state == RequestState::Pending && o.as_ref() == Some(origin))
            .map(|((_, id), _)| id.clone())
            .collect();

        ids.iter().filter(|id| self.cancel(Some(origin), id)).count()
    }

    /// State of a request tracked for `origin`.
    #[must_use]
    pub fn state(&self, origin: Option<&Origin>, id: &RequestId) -> Option<RequestState> {
        self.inner
            .requests
            .lock()
            .get(&(origin.cloned(), id.clone()))
            .map(|t| t.state)
    }

    /// Returns `true` while `origin` has `id` in flight.
    #[must_use]
    pub fn is_tracked(&self, origin: Option<&Origin>, id: &RequestId) -> bool {
        self.inner
            .requests
            .lock()
            .contains_key(&(origin.cloned(), id.clone()))
    }

    /// Number of tracked requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Returns `true` if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Records progress for a token of `origin`.
    ///
    /// Returns the owning request id, or `None` if no tracked request of
    /// that origin holds the token.
    pub fn record_progress(
        &self,
        origin: Option<&Origin>,
        token: &ProgressToken,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Option<RequestId> {
        let mut map = self.inner.progress.lock();
        let snapshot = map.get_mut(&(origin.cloned(), token.clone()))?;
        snapshot.progress = progress;
        snapshot.total = total;
        snapshot.message = message;
        Some(snapshot.request_id.clone())
    }

    /// Last progress reported for a token of `origin`.
    #[must_use]
    pub fn progress(&self, origin: Option<&Origin>, token: &ProgressToken) -> Option<ProgressSnapshot> {
        self.inner
            .progress
            .lock()
            .get(&(origin.cloned(), token.clone()))
            .cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================
