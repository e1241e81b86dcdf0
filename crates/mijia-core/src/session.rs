//! Peripheral session: one connect → subscribe → publish cycle.
//!
//! A [`PeripheralSession`] owns everything about one peripheral's live
//! connection: the state machine, the connection handle, the notification
//! task, the disconnect observer and the watchdog. Exactly one cycle per
//! peripheral can be in flight; a second [`start`](PeripheralSession::start)
//! is rejected with [`Error::SessionBusy`] rather than silently ignored, so
//! callers can tell "already running" from "started".
//!
//! The session never reschedules itself. Retry cadence belongs to the
//! [`PollScheduler`](crate::poll::PollScheduler); recovery from a silent
//! peripheral belongs to the [`Watchdog`](crate::watchdog::Watchdog).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mijia_types::{Reading, SensorAddress, SensorKind, uuids};

use crate::decode;
use crate::error::{Error, Result};
use crate::publish::{Capability, Measurement, Publisher, WarningClass, WarningLight, WarningSink};
use crate::settings::SensorSettings;
use crate::transport::{Characteristic, Peripheral, Transport};
use crate::watchdog::{DEFAULT_WATCHDOG_TIMEOUT, Watchdog};

/// Default timeout for resolving and connecting to a peripheral.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// RSSI below this raises a weak-signal warning.
pub const DEFAULT_RSSI_WARNING_FLOOR: i16 = -80;

/// Payload written to enable notifications on stock firmware.
const NOTIFY_ENABLE_PAYLOAD: [u8; 2] = [0x01, 0x00];

/// Lifecycle of one session cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No cycle in flight.
    Idle,
    /// Resolving the advertisement and opening the connection.
    Connecting,
    /// Walking GATT services and characteristics.
    ServiceDiscovery,
    /// Subscribed, waiting for the first notification.
    Subscribed,
    /// At least one notification accepted.
    Receiving,
    /// Peripheral dropped the connection; teardown in progress.
    Disconnected,
}

/// Configuration for one peripheral session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// The sensor kind, selecting wire format and GATT wiring.
    pub kind: SensorKind,
    /// Calibration offset added to every temperature (°C).
    pub temperature_offset: f32,
    /// Time allowed between notifications before forced teardown.
    pub watchdog_timeout: Duration,
    /// Timeout for the resolve and connect steps.
    pub connect_timeout: Duration,
    /// Read and log the firmware revision after connecting.
    pub read_firmware: bool,
    /// Disconnect after the first published reading instead of staying
    /// subscribed until the watchdog or peripheral ends the cycle.
    /// Saves the coin cell; the poll scheduler reconnects next tick.
    pub disconnect_after_reading: bool,
    /// RSSI floor below which a weak-signal warning is raised.
    pub rssi_warning_floor: i16,
}

impl SessionConfig {
    /// Create a config for the given kind with defaults.
    #[must_use]
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            temperature_offset: 0.0,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_firmware: true,
            disconnect_after_reading: true,
            rssi_warning_floor: DEFAULT_RSSI_WARNING_FLOOR,
        }
    }

    /// Create a config from user settings.
    #[must_use]
    pub fn with_settings(kind: SensorKind, settings: &SensorSettings) -> Self {
        Self {
            temperature_offset: settings.temperature_offset,
            watchdog_timeout: settings.watchdog_timeout,
            ..Self::new(kind)
        }
    }

    /// Set the temperature calibration offset.
    #[must_use]
    pub fn temperature_offset(mut self, offset: f32) -> Self {
        self.temperature_offset = offset;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the watchdog timeout.
    #[must_use]
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Enable or disable the firmware revision read.
    #[must_use]
    pub fn read_firmware(mut self, enabled: bool) -> Self {
        self.read_firmware = enabled;
        self
    }

    /// Keep the subscription open after the first reading.
    #[must_use]
    pub fn stay_subscribed(mut self) -> Self {
        self.disconnect_after_reading = false;
        self
    }
}

/// Everything owned by a live connection.
///
/// Fields after `peripheral` fill in as the cycle progresses so a failure
/// (or concurrent `stop`) at any step can tear down whatever exists.
struct ActiveConnection {
    peripheral: Arc<dyn Peripheral>,
    data: Option<Arc<dyn Characteristic>>,
    notify_task: Option<tokio::task::JoinHandle<()>>,
    disconnect_task: Option<tokio::task::JoinHandle<()>>,
}

/// Session manager for one BLE sensor peripheral.
pub struct PeripheralSession {
    address: SensorAddress,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publisher>,
    warnings: WarningLight,
    state: Mutex<SessionState>,
    connection: tokio::sync::Mutex<Option<ActiveConnection>>,
    watchdog: Watchdog,
    /// Bumped on every `start`. Teardowns spawned by a cycle's watchdog,
    /// disconnect observer or notification loop carry their cycle's value
    /// and no-op once a newer cycle has begun.
    generation: AtomicU64,
}

impl PeripheralSession {
    /// Create an idle session for one peripheral.
    pub fn new(
        address: SensorAddress,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn Publisher>,
        warning_sink: Arc<dyn WarningSink>,
    ) -> Arc<Self> {
        let warnings = WarningLight::new(address.clone(), warning_sink);
        let watchdog = Watchdog::new(config.watchdog_timeout);
        Arc::new(Self {
            address,
            config,
            transport,
            publisher,
            warnings,
            state: Mutex::new(SessionState::Idle),
            connection: tokio::sync::Mutex::new(None),
            watchdog,
            generation: AtomicU64::new(0),
        })
    }

    /// The peripheral this session manages.
    #[must_use]
    pub fn address(&self) -> &SensorAddress {
        &self.address
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state poisoned") = state;
    }

    /// Run one connect → subscribe cycle.
    ///
    /// Returns once the subscription is established (notifications then
    /// flow on a background task) or with the error that ended the cycle.
    /// Fails fast with [`Error::SessionBusy`] when a cycle is already in
    /// flight for this peripheral.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.config.kind.data_service().is_none() {
            return Err(Error::invalid_config(format!(
                "{} is broadcast-only; decode its advertisements instead",
                self.config.kind
            )));
        }

        {
            let mut state = self.state.lock().expect("session state poisoned");
            if *state != SessionState::Idle {
                return Err(Error::SessionBusy {
                    address: self.address.clone(),
                });
            }
            *state = SessionState::Connecting;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        info!(address = %self.address, kind = %self.config.kind, "starting session cycle");
        self.warnings.clear().await;

        match self.run_cycle().await {
            Ok(()) => Ok(()),
            Err((class, error)) => {
                warn!(address = %self.address, %error, "session cycle failed");
                self.warnings.raise(class, error.to_string()).await;
                self.stop().await;
                Err(error)
            }
        }
    }

    /// Force any in-flight cycle to stop, then start a new one.
    pub async fn supersede(self: &Arc<Self>) -> Result<()> {
        if self.state() != SessionState::Idle {
            info!(address = %self.address, "superseding in-flight session");
        }
        self.stop().await;
        self.start().await
    }

    /// Tear down the session: disarm the watchdog, unsubscribe and
    /// disconnect best-effort, drop the connection handle.
    ///
    /// Idempotent and always safe to call, even with no cycle in flight.
    pub async fn stop(&self) {
        self.watchdog.disarm();

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            if let Some(task) = connection.notify_task {
                task.abort();
            }
            if let Some(task) = connection.disconnect_task {
                task.abort();
            }
            if let Some(data) = connection.data
                && let Err(error) = data.unsubscribe().await
            {
                debug!(address = %self.address, %error, "unsubscribe failed");
            }
            if let Err(error) = connection.peripheral.disconnect().await {
                debug!(address = %self.address, %error, "disconnect failed");
            }
            info!(address = %self.address, "session stopped");
        }

        self.set_state(SessionState::Idle);
    }

    /// Teardown on behalf of one cycle: skipped when a newer cycle has
    /// already started, so a stale watchdog or disconnect task can never
    /// tear down its successor.
    async fn stop_for_cycle(&self, cycle: u64) {
        if self.generation.load(Ordering::SeqCst) != cycle {
            debug!(address = %self.address, "ignoring teardown for a superseded cycle");
            return;
        }
        self.stop().await;
    }

    async fn run_cycle(self: &Arc<Self>) -> std::result::Result<(), (WarningClass, Error)> {
        let subscribe = |e| (WarningClass::SubscribeFailed, e);
        let cycle = self.generation.load(Ordering::SeqCst);

        let service_uuid = self.config.kind.data_service().expect("checked in start");
        let characteristic_uuid = self
            .config
            .kind
            .data_characteristic()
            .expect("kinds with a data service have a data characteristic");

        let advertisement = self
            .with_timeout("find_by_address", self.transport.find_by_address(&self.address))
            .await
            .map_err(subscribe)?;

        if let Some(rssi) = advertisement.rssi() {
            self.publish_rssi(rssi).await;
        }

        let peripheral = self
            .with_timeout("connect", advertisement.connect())
            .await
            .map_err(subscribe)?;
        info!(address = %self.address, "connected");

        // Store the half-open connection so stop() can tear it down from
        // here on.
        *self.connection.lock().await = Some(ActiveConnection {
            peripheral: Arc::clone(&peripheral),
            data: None,
            notify_task: None,
            disconnect_task: None,
        });
        self.set_state(SessionState::ServiceDiscovery);

        // Stock firmware needs an explicit enable write before it notifies.
        // Failure is not fatal; some revisions notify regardless.
        if let Some((enable_service, enable_characteristic)) = self.config.kind.notify_enable()
            && let Err(error) = self
                .enable_notifications(peripheral.as_ref(), enable_service, enable_characteristic)
                .await
        {
            warn!(address = %self.address, %error, "failed to enable notifications");
            self.warnings
                .raise(WarningClass::NotifyEnableFailed, error.to_string())
                .await;
        }

        if self.config.read_firmware {
            match self.read_firmware(peripheral.as_ref()).await {
                Ok(firmware) => info!(address = %self.address, firmware, "firmware revision"),
                Err(error) => {
                    debug!(address = %self.address, %error, "firmware revision unavailable");
                }
            }
        }

        let data_service = peripheral.service(service_uuid).await.map_err(subscribe)?;
        let data = data_service
            .characteristic(characteristic_uuid)
            .await
            .map_err(subscribe)?;
        let stream = data.subscribe().await.map_err(subscribe)?;
        self.set_state(SessionState::Subscribed);
        info!(address = %self.address, "subscribed to notifications");

        let notify_task = tokio::spawn(Self::notification_loop(
            Arc::downgrade(self),
            stream,
            cycle,
        ));
        {
            let mut connection = self.connection.lock().await;
            match connection.as_mut() {
                Some(connection) => {
                    connection.data = Some(Arc::clone(&data));
                    connection.notify_task = Some(notify_task);
                }
                None => {
                    // stop() ran concurrently and already tore us down.
                    notify_task.abort();
                    return Err(subscribe(Error::NotConnected));
                }
            }
        }
        self.arm_watchdog();

        if let Some((battery_service, battery_characteristic)) =
            self.config.kind.battery_characteristic()
            && let Err(error) = self
                .read_battery(peripheral.as_ref(), battery_service, battery_characteristic)
                .await
        {
            warn!(address = %self.address, %error, "battery read failed");
        }

        let mut disconnects = peripheral.disconnect_events();
        let weak = Arc::downgrade(self);
        let disconnect_task = tokio::spawn(async move {
            if disconnects.recv().await.is_ok()
                && let Some(session) = weak.upgrade()
            {
                info!(address = %session.address, "peripheral disconnected");
                if session.generation.load(Ordering::SeqCst) == cycle {
                    session.set_state(SessionState::Disconnected);
                }
                // Teardown runs on its own task so aborting this observer
                // during stop() cannot cancel the cleanup.
                tokio::spawn(async move { session.stop_for_cycle(cycle).await });
            }
        });
        {
            let mut connection = self.connection.lock().await;
            match connection.as_mut() {
                Some(connection) => connection.disconnect_task = Some(disconnect_task),
                None => {
                    disconnect_task.abort();
                    return Err(subscribe(Error::NotConnected));
                }
            }
        }

        Ok(())
    }

    async fn notification_loop(weak: Weak<Self>, mut stream: BoxStream<'static, Vec<u8>>, cycle: u64) {
        let mut last_payload: Option<Vec<u8>> = None;
        while let Some(payload) = stream.next().await {
            let Some(session) = weak.upgrade() else { break };

            // Byte-identical repeat of the previous notification.
            if last_payload.as_deref() == Some(payload.as_slice()) {
                continue;
            }
            last_payload = Some(payload.clone());

            let published = session.on_notification(&payload).await;
            if published && session.config.disconnect_after_reading {
                debug!(address = %session.address, "reading published, releasing connection");
                tokio::spawn(async move { session.stop_for_cycle(cycle).await });
                break;
            }
        }
    }

    /// Handle one accepted (non-duplicate) notification. Returns whether a
    /// validated reading was published.
    async fn on_notification(self: &Arc<Self>, payload: &[u8]) -> bool {
        self.set_state(SessionState::Receiving);
        self.arm_watchdog();

        match decode::decode(self.config.kind, payload, self.config.temperature_offset) {
            Ok(reading) => {
                let reading = decode::validate(reading, &self.config.kind.ranges());
                if reading.is_empty() {
                    debug!(address = %self.address, "notification produced no publishable fields");
                    return false;
                }
                debug!(address = %self.address, %reading, "decoded notification");
                self.warnings.clear().await;
                self.publish_reading(&reading).await;
                true
            }
            Err(error) => {
                warn!(address = %self.address, %error, "failed to decode notification");
                self.warnings
                    .raise(WarningClass::BadPayload, error.to_string())
                    .await;
                false
            }
        }
    }

    fn arm_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cycle = self.generation.load(Ordering::SeqCst);
        self.watchdog.arm(move || {
            if let Some(session) = weak.upgrade() {
                warn!(
                    address = %session.address,
                    "no notification within watchdog timeout, forcing teardown"
                );
                tokio::spawn(async move { session.stop_for_cycle(cycle).await });
            }
        });
    }

    async fn publish_rssi(&self, rssi: i16) {
        self.publisher
            .ensure_capability(&self.address, Capability::Rssi)
            .await;
        self.publisher
            .publish(&self.address, Measurement::MeasureRssi(rssi))
            .await;

        let percent = decode::rssi_percent(rssi);
        debug!(address = %self.address, rssi, percent, "advertisement RSSI");
        if rssi < self.config.rssi_warning_floor {
            self.warnings
                .raise(
                    WarningClass::WeakSignal,
                    format!("signal strength is too low ({rssi} dBm / ~{percent}%)"),
                )
                .await;
        }
    }

    async fn publish_reading(&self, reading: &Reading) {
        if reading.voltage.is_some() {
            self.publisher
                .ensure_capability(&self.address, Capability::Voltage)
                .await;
        }
        for measurement in Measurement::from_reading(reading) {
            self.publisher.publish(&self.address, measurement).await;
        }
    }

    async fn enable_notifications(
        &self,
        peripheral: &dyn Peripheral,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<()> {
        let service = peripheral.service(service_uuid).await?;
        let characteristic = service.characteristic(characteristic_uuid).await?;

        let current = characteristic.read().await?;
        if current.starts_with(&NOTIFY_ENABLE_PAYLOAD) {
            debug!(address = %self.address, "notifications already enabled");
            return Ok(());
        }

        characteristic.write(&NOTIFY_ENABLE_PAYLOAD).await?;
        info!(address = %self.address, "enabled notifications");
        Ok(())
    }

    async fn read_firmware(&self, peripheral: &dyn Peripheral) -> Result<String> {
        let service = peripheral.service(uuids::DEVICE_INFO_SERVICE).await?;
        let characteristic = service.characteristic(uuids::FIRMWARE_REVISION).await?;
        let data = characteristic.read().await?;
        Ok(String::from_utf8_lossy(&data).trim_matches('\0').to_string())
    }

    async fn read_battery(
        &self,
        peripheral: &dyn Peripheral,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<()> {
        let service = peripheral.service(service_uuid).await?;
        let characteristic = service.characteristic(characteristic_uuid).await?;
        let data = characteristic.read().await?;

        let battery = decode::decode_battery_level(&data)?;
        if battery <= 100 {
            info!(address = %self.address, battery, "battery level");
            self.publisher
                .publish(&self.address, Measurement::MeasureBattery(battery))
                .await;
        } else {
            debug!(address = %self.address, battery, "ignoring implausible battery reading");
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.connect_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation, self.config.connect_timeout)),
        }
    }
}

impl std::fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("address", &self.address)
            .field("kind", &self.config.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
