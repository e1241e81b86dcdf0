//! Publication and warning sinks.
//!
//! The session layer has exactly two outward-facing side effects: named
//! measurements and transient user-visible warnings. Both go through the
//! traits here, so the host environment (or a test) decides where they
//! land. [`ChannelPublisher`] is the in-process implementation used by the
//! CLI.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use mijia_types::{Reading, SensorAddress};

/// One named measurement, ready for publication.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "capability", content = "value", rename_all = "snake_case")]
pub enum Measurement {
    /// Temperature in °C.
    MeasureTemperature(f32),
    /// Relative humidity in %.
    MeasureHumidity(f32),
    /// Battery level in %.
    MeasureBattery(u8),
    /// Signal strength in dBm.
    MeasureRssi(i16),
    /// Battery cell voltage in V.
    MeasureVoltage(f32),
}

impl Measurement {
    /// The capability name this measurement publishes under.
    #[must_use]
    pub fn capability(&self) -> &'static str {
        match self {
            Measurement::MeasureTemperature(_) => "measure_temperature",
            Measurement::MeasureHumidity(_) => "measure_humidity",
            Measurement::MeasureBattery(_) => "measure_battery",
            Measurement::MeasureRssi(_) => "measure_rssi",
            Measurement::MeasureVoltage(_) => "measure_voltage",
        }
    }

    /// Expand a reading into its individual measurements.
    #[must_use]
    pub fn from_reading(reading: &Reading) -> Vec<Measurement> {
        let mut out = Vec::new();
        if let Some(t) = reading.temperature {
            out.push(Measurement::MeasureTemperature(t));
        }
        if let Some(h) = reading.humidity {
            out.push(Measurement::MeasureHumidity(h));
        }
        if let Some(b) = reading.battery {
            out.push(Measurement::MeasureBattery(b));
        }
        if let Some(v) = reading.voltage {
            out.push(Measurement::MeasureVoltage(v));
        }
        if let Some(r) = reading.rssi {
            out.push(Measurement::MeasureRssi(r));
        }
        out
    }
}

/// Capabilities that may be absent on devices paired before they existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `measure_rssi`.
    Rssi,
    /// `measure_voltage`.
    Voltage,
}

impl Capability {
    /// The capability name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Rssi => "measure_rssi",
            Capability::Voltage => "measure_voltage",
        }
    }
}

/// Sink for published measurements.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one measurement for one peripheral.
    async fn publish(&self, address: &SensorAddress, measurement: Measurement);

    /// Register a capability if the host does not have it yet. Idempotent.
    async fn ensure_capability(&self, address: &SensorAddress, capability: Capability);
}

/// Sink for transient user-facing warnings. `None` clears.
#[async_trait]
pub trait WarningSink: Send + Sync {
    /// Set or clear the warning for one peripheral.
    async fn set_warning(&self, address: &SensorAddress, message: Option<String>);
}

/// Failure classes and their auto-clear delays.
///
/// The delays are deliberately distinct per class so a user scrolling past
/// sees the slow-clearing classes longer; they match the behavior users of
/// the original firmware integrations expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningClass {
    /// RSSI below the usable floor.
    WeakSignal,
    /// Connect/service/characteristic/subscribe step failed.
    SubscribeFailed,
    /// Writing the notify-enable payload failed.
    NotifyEnableFailed,
    /// Notification payload failed to decode.
    BadPayload,
}

impl WarningClass {
    /// How long the warning stays up before auto-clearing.
    #[must_use]
    pub fn clear_after(&self) -> Duration {
        match self {
            WarningClass::WeakSignal => Duration::from_secs(15),
            WarningClass::SubscribeFailed => Duration::from_secs(65),
            WarningClass::NotifyEnableFailed => Duration::from_secs(95),
            WarningClass::BadPayload => Duration::from_secs(55),
        }
    }
}

/// Owns the auto-clear timer for one peripheral's warning.
///
/// Raising a warning cancels any pending clear task and schedules a new
/// one; the timer handle lives here and nowhere else, so no clear task can
/// outlive the light that armed it.
pub struct WarningLight {
    address: SensorAddress,
    sink: Arc<dyn WarningSink>,
    clear_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WarningLight {
    /// Create a warning light for one peripheral.
    pub fn new(address: SensorAddress, sink: Arc<dyn WarningSink>) -> Self {
        Self {
            address,
            sink,
            clear_task: Mutex::new(None),
        }
    }

    /// Raise a transient warning; it auto-clears after the class delay.
    pub async fn raise(&self, class: WarningClass, message: String) {
        self.cancel_pending_clear();
        self.sink.set_warning(&self.address, Some(message)).await;

        let sink = Arc::clone(&self.sink);
        let address = self.address.clone();
        let delay = class.clear_after();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.set_warning(&address, None).await;
        });
        *self.clear_task.lock().expect("warning light poisoned") = Some(handle);
    }

    /// Clear the warning now and cancel any pending auto-clear.
    pub async fn clear(&self) {
        self.cancel_pending_clear();
        self.sink.set_warning(&self.address, None).await;
    }

    fn cancel_pending_clear(&self) {
        if let Some(task) = self
            .clear_task
            .lock()
            .expect("warning light poisoned")
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for WarningLight {
    fn drop(&mut self) {
        self.cancel_pending_clear();
    }
}

/// A published measurement with the peripheral it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedMeasurement {
    /// Peripheral the measurement was read from.
    pub address: SensorAddress,
    /// The measurement itself.
    pub measurement: Measurement,
}

/// Broadcast-channel publisher for in-process consumers.
pub struct ChannelPublisher {
    sender: broadcast::Sender<PublishedMeasurement>,
    capabilities: Mutex<HashSet<(SensorAddress, &'static str)>>,
}

impl ChannelPublisher {
    /// Create a publisher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capabilities: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to published measurements.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMeasurement> {
        self.sender.subscribe()
    }

    /// Whether a capability has been registered for a peripheral.
    pub fn has_capability(&self, address: &SensorAddress, capability: Capability) -> bool {
        self.capabilities
            .lock()
            .expect("capability set poisoned")
            .contains(&(address.clone(), capability.name()))
    }
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, address: &SensorAddress, measurement: Measurement) {
        // Ignore error if no receivers
        let _ = self.sender.send(PublishedMeasurement {
            address: address.clone(),
            measurement,
        });
    }

    async fn ensure_capability(&self, address: &SensorAddress, capability: Capability) {
        let mut capabilities = self.capabilities.lock().expect("capability set poisoned");
        if capabilities.insert((address.clone(), capability.name())) {
            info!(%address, capability = capability.name(), "capability added");
        }
    }
}

/// Warning sink that forwards to the log.
///
/// Useful where there is no host UI to surface warnings, e.g. the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWarningSink;

#[async_trait]
impl WarningSink for LogWarningSink {
    async fn set_warning(&self, address: &SensorAddress, message: Option<String>) {
        match message {
            Some(message) => warn!(%address, "{message}"),
            None => info!(%address, "warning cleared"),
        }
    }
}
