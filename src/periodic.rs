//! Owned, cancellable recurring background work.
//!
//! Health checks, cache sweeps and history pruning all run on a
//! [`PeriodicTask`]. The component that spawns a task owns it; dropping or
//! stopping the handle aborts the task so no periodic work outlives its owner.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace};

// ============================================================================
// PeriodicTask
// ============================================================================

/// A recurring task that ticks every `period` until stopped.
///
/// The first tick fires one full period after spawning. Returning
/// [`ControlFlow::Break`] from the tick closure ends the task on its own.
pub struct PeriodicTask {
    /// Task name for logging.
    name: &'static str,
    /// Handle of the spawned loop.
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns a periodic task on the current tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in log output
    /// * `period` - Interval between ticks
    /// * `tick` - Closure producing the work for one tick
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                trace!(task = name, "Periodic tick");
                if tick().await.is_break() {
                    debug!(task = name, "Periodic task finished");
                    break;
                }
            }
        });

        let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        debug!(task = name, period_ms, "Periodic task started");

        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Returns the task name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` while the loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Aborts the task.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(task = self.name, "Periodic task stopped");
        }
    }

    /// Aborts the task and waits until it has fully terminated.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
            debug!(task = self.name, "Periodic task joined");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let mut task = PeriodicTask::spawn("test", Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_ends_task() {
        let task = PeriodicTask::spawn("once", Duration::from_millis(10), || async {
            ControlFlow::Break(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let task = PeriodicTask::spawn("dropped", Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });
        drop(task);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
