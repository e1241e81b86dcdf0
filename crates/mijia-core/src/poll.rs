//! Poll scheduler: the supervising retry cadence for a session.
//!
//! The scheduler owns the only timer that restarts session cycles. The
//! session itself never reschedules anything — a failed or busy cycle is
//! logged and the next tick simply tries again, so one bad cycle can never
//! kill the cadence.
//!
//! Reconfiguring the interval atomically replaces the ticker: the old task
//! is cancelled under the same lock that installs the new one, so two
//! tickers can never run for the same device.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::PeripheralSession;

pub use crate::settings::DEFAULT_POLL_INTERVAL;

struct Schedule {
    interval: Duration,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Periodic driver for one peripheral session.
pub struct PollScheduler {
    session: Arc<PeripheralSession>,
    schedule: Mutex<Option<Schedule>>,
}

impl PollScheduler {
    /// Create a scheduler for the given session. No timer runs yet.
    pub fn new(session: Arc<PeripheralSession>) -> Self {
        Self {
            session,
            schedule: Mutex::new(None),
        }
    }

    /// Start polling at the given interval.
    ///
    /// The first cycle runs immediately; subsequent cycles run every
    /// `interval`. Replaces any running schedule, like
    /// [`reconfigure`](Self::reconfigure).
    pub fn start(&self, interval: Duration) -> Result<()> {
        self.reconfigure(interval)
    }

    /// Atomically replace the poll interval.
    ///
    /// Cancels the old ticker and starts a new one; never leaves two
    /// tickers running. 1 s granularity.
    pub fn reconfigure(&self, interval: Duration) -> Result<()> {
        if interval < Duration::from_secs(1) {
            return Err(Error::invalid_config("poll interval must be >= 1s"));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::run(
            Arc::clone(&self.session),
            interval,
            cancel.clone(),
        ));

        let mut schedule = self.schedule.lock().expect("schedule poisoned");
        if let Some(old) = schedule.replace(Schedule {
            interval,
            cancel,
            task,
        }) {
            old.cancel.cancel();
            old.task.abort();
        }
        info!(
            address = %self.session.address(),
            interval_secs = interval.as_secs(),
            "poll schedule (re)configured"
        );
        Ok(())
    }

    /// The configured interval, if a schedule is running.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.schedule
            .lock()
            .expect("schedule poisoned")
            .as_ref()
            .map(|s| s.interval)
    }

    /// Stop polling. The in-flight session cycle, if any, is not touched.
    pub fn shutdown(&self) {
        if let Some(schedule) = self.schedule.lock().expect("schedule poisoned").take() {
            schedule.cancel.cancel();
            schedule.task.abort();
            info!(address = %self.session.address(), "poll schedule stopped");
        }
    }

    async fn run(session: Arc<PeripheralSession>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(address = %session.address(), "poll schedule cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match session.start().await {
                        Ok(()) => {}
                        Err(Error::SessionBusy { .. }) => {
                            // Previous cycle still delivering; nothing lost.
                            debug!(address = %session.address(), "cycle still in flight, skipping tick");
                        }
                        Err(error) => {
                            // The session already warned and went idle.
                            warn!(address = %session.address(), %error, "poll cycle failed");
                        }
                    }
                }
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Ok(mut schedule) = self.schedule.lock()
            && let Some(schedule) = schedule.take()
        {
            schedule.cancel.cancel();
            schedule.task.abort();
        }
    }
}
