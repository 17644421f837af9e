//! Supervised tasks and cancelable scheduled callbacks
//!
//! Every background activity of a connection (relay pumps, heartbeats,
//! periodic re-STUN, relay idle sweep, ping timeouts) is spawned through a
//! [`Spawner`]. Closing the connection cancels the spawner's root token and
//! waits on its tracker, so nothing spawned here outlives `close()`.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Spawns tasks onto a captured runtime, tracked and cancelable as a group
#[derive(Clone, Debug)]
pub struct Spawner {
    handle: Handle,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Spawner {
    /// Capture the current runtime. `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        let handle = Handle::try_current().ok()?;
        Some(Self {
            handle,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        })
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(fut, &self.handle);
    }

    /// Root token; cancelled when the owner shuts down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Number of tasks still running
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything and wait until every spawned task has returned.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// A callback scheduled to run once after a delay
///
/// Stopping (or dropping) the timer before it fires guarantees the
/// callback never runs. A callback that has already started is not
/// interrupted, so callbacks that mutate shared state must re-check a
/// generation under their own lock.
#[derive(Debug)]
pub struct Timer {
    token: CancellationToken,
}

impl Timer {
    pub fn after<F>(spawner: &Spawner, delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = spawner.token.child_token();
        let task_token = token.clone();
        spawner.spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !task_token.is_cancelled() {
                        task_token.cancel();
                        f();
                    }
                }
            }
        });
        Self { token }
    }

    /// Cancel the timer. Returns true if it had not fired yet.
    pub fn stop(&self) -> bool {
        let pending = !self.token.is_cancelled();
        self.token.cancel();
        pending
    }

    /// Whether the timer is still waiting to fire
    pub fn is_pending(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let spawner = Spawner::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = Timer::after(&spawner, Duration::from_secs(3), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
        assert!(!timer.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_fires() {
        let spawner = Spawner::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = Timer::after(&spawner, Duration::from_secs(3), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.stop());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_all_tasks() {
        let spawner = Spawner::current().unwrap();
        let _a = Timer::after(&spawner, Duration::from_secs(60), || {});
        let _b = Timer::after(&spawner, Duration::from_secs(60), || {});
        let token = spawner.token().clone();
        spawner.spawn(async move { token.cancelled().await });
        tokio::task::yield_now().await;
        assert_eq!(spawner.task_count(), 3);

        spawner.shutdown().await;
        assert_eq!(spawner.task_count(), 0);
    }
}
