//! Notification-timeout watchdog.
//!
//! A subscribed peripheral can stop notifying without ever disconnecting —
//! flat battery, out of range, firmware wedge. The watchdog converts that
//! silence into an explicit teardown: armed after subscribe and re-armed on
//! every accepted notification, it runs the owner-supplied stop action when
//! the timeout elapses with no re-arm.
//!
//! The timer task handle is owned here and cancelled here, never by the
//! session that armed it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

/// Default time allowed between notifications before the session is torn down.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Watchdog lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// No timer running.
    Disarmed,
    /// Timer running; will fire unless re-armed or disarmed.
    Armed,
    /// Timer elapsed and the stop action was invoked.
    Fired,
}

struct WatchdogInner {
    state: WatchdogState,
    task: Option<tokio::task::JoinHandle<()>>,
    /// Incremented on every arm/disarm so a stale timer that already woke
    /// up can tell it has been superseded.
    generation: u64,
}

/// Timer forcing recovery when an expected notification never arrives.
pub struct Watchdog {
    timeout: Duration,
    inner: Arc<Mutex<WatchdogInner>>,
}

impl Watchdog {
    /// Create a disarmed watchdog with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Arc::new(Mutex::new(WatchdogInner {
                state: WatchdogState::Disarmed,
                task: None,
                generation: 0,
            })),
        }
    }

    /// The configured timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WatchdogState {
        self.inner.lock().expect("watchdog poisoned").state
    }

    /// (Re)arm the watchdog: cancel any running timer, start a new one.
    ///
    /// `on_expiry` runs at most once, from the timer task; it should spawn
    /// any async work (the session's `stop`) rather than block.
    pub fn arm<F>(&self, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("watchdog poisoned");
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.state = WatchdogState::Armed;

        let generation = inner.generation;
        let timeout = self.timeout;
        let shared = Arc::clone(&self.inner);
        inner.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            {
                let mut inner = shared.lock().expect("watchdog poisoned");
                if inner.generation != generation {
                    // Re-armed or disarmed while we were waking up.
                    return;
                }
                inner.state = WatchdogState::Fired;
                inner.task = None;
            }
            debug!(?timeout, "watchdog expired, forcing session teardown");
            on_expiry();
        }));
    }

    /// Disarm: cancel the timer without firing. Idempotent.
    pub fn disarm(&self) {
        let mut inner = self.inner.lock().expect("watchdog poisoned");
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.state = WatchdogState::Disarmed;
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock()
            && let Some(task) = inner.task.take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_after_timeout() {
        let fired = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(Duration::from_secs(10));

        let counter = Arc::clone(&fired);
        watchdog.arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(watchdog.state(), WatchdogState::Armed);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.state(), WatchdogState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_postpones_expiry() {
        let fired = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(Duration::from_secs(10));

        for _ in 0..3 {
            let counter = Arc::clone(&fired);
            watchdog.arm(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(6)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(Duration::from_secs(10));

        let counter = Arc::clone(&fired);
        watchdog.arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        watchdog.disarm();
        assert_eq!(watchdog.state(), WatchdogState::Disarmed);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disarm_is_idempotent() {
        let watchdog = Watchdog::new(Duration::from_secs(10));
        watchdog.disarm();
        watchdog.disarm();
        assert_eq!(watchdog.state(), WatchdogState::Disarmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_runs_at_most_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let watchdog = Watchdog::new(Duration::from_secs(10));

        let counter = Arc::clone(&fired);
        watchdog.arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
