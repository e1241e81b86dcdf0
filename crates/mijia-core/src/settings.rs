//! Per-device settings supplied by the host.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::watchdog::DEFAULT_WATCHDOG_TIMEOUT;

/// Default interval between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// User-tunable settings for one sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSettings {
    /// Calibration offset added to every temperature reading (°C).
    pub temperature_offset: f32,
    /// Interval between poll cycles. 1 s granularity.
    pub poll_interval: Duration,
    /// Time allowed between notifications before forced teardown.
    pub watchdog_timeout: Duration,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            temperature_offset: 0.0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
        }
    }
}

impl SensorSettings {
    /// Create settings with the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the temperature calibration offset (°C, may be negative).
    #[must_use]
    pub fn temperature_offset(mut self, offset: f32) -> Self {
        self.temperature_offset = offset;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the watchdog timeout.
    #[must_use]
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Validate the settings and return an error if invalid.
    ///
    /// Checks that:
    /// - `poll_interval` is at least 1 second
    /// - `watchdog_timeout` is > 0
    /// - `temperature_offset` is finite
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval < Duration::from_secs(1) {
            return Err(Error::invalid_config("poll_interval must be >= 1s"));
        }
        if self.watchdog_timeout.is_zero() {
            return Err(Error::invalid_config("watchdog_timeout must be > 0"));
        }
        if !self.temperature_offset.is_finite() {
            return Err(Error::invalid_config("temperature_offset must be finite"));
        }
        Ok(())
    }
}
