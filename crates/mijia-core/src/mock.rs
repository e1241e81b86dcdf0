//! Mock transport implementation for testing.
//!
//! Drives the session, poll and discovery code paths without BLE
//! hardware: scripted services and characteristics, injectable
//! notifications, failure injection per step, optional latency, and
//! counters for every interesting call.
//!
//! Also provides [`MockPublisher`] and [`MockWarningSink`], recording
//! sinks for asserting on published measurements and warnings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use mijia_types::SensorAddress;

use crate::error::{Error, Result};
use crate::publish::{Capability, Measurement, PublishedMeasurement, Publisher, WarningSink};
use crate::transport::{
    Advertisement, AdvertisementRecord, Characteristic, Peripheral, Service, Transport,
};

/// A mock BLE transport holding scripted sensors.
#[derive(Default)]
pub struct MockTransport {
    sensors: Mutex<HashMap<SensorAddress, Arc<MockSensor>>>,
    discovery_records: Mutex<Vec<AdvertisementRecord>>,
    discover_calls: AtomicU32,
    discover_latency: Mutex<Duration>,
}

impl MockTransport {
    /// Create an empty mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sensor so `find_by_address` can resolve it.
    pub fn add_sensor(&self, sensor: Arc<MockSensor>) {
        self.sensors
            .lock()
            .expect("mock poisoned")
            .insert(sensor.address.clone(), sensor);
    }

    /// Script the records returned by `discover`.
    pub fn set_discovery_records(&self, records: Vec<AdvertisementRecord>) {
        *self.discovery_records.lock().expect("mock poisoned") = records;
    }

    /// Add artificial latency to every `discover` call.
    pub fn set_discover_latency(&self, latency: Duration) {
        *self.discover_latency.lock().expect("mock poisoned") = latency;
    }

    /// Number of `discover` invocations so far.
    pub fn discover_calls(&self) -> u32 {
        self.discover_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn find_by_address(&self, address: &SensorAddress) -> Result<Arc<dyn Advertisement>> {
        let sensor = self
            .sensors
            .lock()
            .expect("mock poisoned")
            .get(address)
            .cloned();
        match sensor {
            Some(sensor) => Ok(sensor),
            None => Err(Error::device_not_found(address.as_str())),
        }
    }

    async fn discover(
        &self,
        _filter: &[Uuid],
        _duration: Duration,
    ) -> Result<Vec<AdvertisementRecord>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.discover_latency.lock().expect("mock poisoned");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(self.discovery_records.lock().expect("mock poisoned").clone())
    }
}

/// A scripted peripheral: advertisement, GATT table and counters in one.
pub struct MockSensor {
    address: SensorAddress,
    /// Self-reference so `connect` can hand the peripheral an owning Arc.
    self_weak: std::sync::Weak<MockSensor>,
    record: Mutex<AdvertisementRecord>,
    characteristics: Mutex<HashMap<(Uuid, Uuid), Arc<MockCharacteristic>>>,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    fail_connect: AtomicBool,
    connect_latency: Mutex<Duration>,
    disconnect_tx: broadcast::Sender<()>,
    connected: AtomicBool,
}

impl MockSensor {
    /// Create a sensor with the given address.
    pub fn new(address: &str) -> Arc<Self> {
        let address = SensorAddress::new(address);
        let (disconnect_tx, _) = broadcast::channel(4);
        Arc::new_cyclic(|self_weak| Self {
            record: Mutex::new(AdvertisementRecord::new(address.clone())),
            address,
            self_weak: self_weak.clone(),
            characteristics: Mutex::new(HashMap::new()),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            fail_connect: AtomicBool::new(false),
            connect_latency: Mutex::new(Duration::ZERO),
            disconnect_tx,
            connected: AtomicBool::new(false),
        })
    }

    /// Create a sensor with a random mock address.
    pub fn new_random() -> Arc<Self> {
        Self::new(&format!("mock{:06x}", rand::random::<u32>() % 0xFF_FFFF))
    }

    /// The sensor's normalized address.
    pub fn address(&self) -> &SensorAddress {
        &self.address
    }

    /// Script the advertised RSSI.
    pub fn set_rssi(&self, rssi: i16) {
        self.record.lock().expect("mock poisoned").rssi = Some(rssi);
    }

    /// Script the advertised local name.
    pub fn set_local_name(&self, name: &str) {
        self.record.lock().expect("mock poisoned").local_name = Some(name.to_string());
    }

    /// Script the advertised service UUID strings.
    pub fn set_service_uuids(&self, uuids: Vec<String>) {
        self.record.lock().expect("mock poisoned").service_uuids = uuids;
    }

    /// Script the advertised service-data entries.
    pub fn set_service_data(&self, entries: Vec<(String, Vec<u8>)>) {
        self.record.lock().expect("mock poisoned").service_data = entries;
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Add artificial latency to every `connect` call.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.connect_latency.lock().expect("mock poisoned") = latency;
    }

    /// Register a characteristic under a service, creating the service.
    pub fn add_characteristic(
        self: &Arc<Self>,
        service: Uuid,
        characteristic: Uuid,
    ) -> Arc<MockCharacteristic> {
        let mock = Arc::new(MockCharacteristic::new(characteristic));
        self.characteristics
            .lock()
            .expect("mock poisoned")
            .insert((service, characteristic), Arc::clone(&mock));
        mock
    }

    /// Number of `connect` invocations so far.
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` invocations so far.
    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Simulate the peripheral dropping the connection.
    pub fn emit_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.disconnect_tx.send(());
    }

    fn service_exists(&self, service: Uuid) -> bool {
        self.characteristics
            .lock()
            .expect("mock poisoned")
            .keys()
            .any(|(s, _)| *s == service)
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<Arc<MockCharacteristic>> {
        self.characteristics
            .lock()
            .expect("mock poisoned")
            .get(&(service, characteristic))
            .cloned()
    }
}

#[async_trait]
impl Advertisement for MockSensor {
    fn rssi(&self) -> Option<i16> {
        self.record.lock().expect("mock poisoned").rssi
    }

    fn record(&self) -> AdvertisementRecord {
        self.record.lock().expect("mock poisoned").clone()
    }

    async fn connect(&self) -> Result<Arc<dyn Peripheral>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.connect_latency.lock().expect("mock poisoned");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::device_not_found(self.address.as_str()));
        }

        self.connected.store(true, Ordering::SeqCst);
        let sensor = self.self_weak.upgrade().expect("mock sensor alive");
        Ok(Arc::new(MockPeripheral { sensor }))
    }
}

/// Open connection to a [`MockSensor`].
pub struct MockPeripheral {
    sensor: Arc<MockSensor>,
}

#[async_trait]
impl Peripheral for MockPeripheral {
    async fn service(&self, uuid: Uuid) -> Result<Arc<dyn Service>> {
        if !self.sensor.service_exists(uuid) {
            return Err(Error::service_not_found(uuid));
        }
        Ok(Arc::new(MockService {
            sensor: Arc::clone(&self.sensor),
            service: uuid,
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.sensor.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.sensor.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect_events(&self) -> broadcast::Receiver<()> {
        self.sensor.disconnect_tx.subscribe()
    }
}

/// A service on a [`MockSensor`].
pub struct MockService {
    sensor: Arc<MockSensor>,
    service: Uuid,
}

#[async_trait]
impl Service for MockService {
    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn Characteristic>> {
        match self.sensor.characteristic(self.service, uuid) {
            Some(characteristic) => Ok(characteristic),
            None => Err(Error::characteristic_not_found(uuid)),
        }
    }
}

/// A scripted characteristic.
pub struct MockCharacteristic {
    uuid: Uuid,
    value: Mutex<Vec<u8>>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_read: AtomicBool,
    fail_subscribe: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    subscribe_calls: AtomicU32,
    unsubscribe_calls: AtomicU32,
}

impl MockCharacteristic {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            value: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            fail_read: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            subscribe_calls: AtomicU32::new(0),
            unsubscribe_calls: AtomicU32::new(0),
        }
    }

    /// The characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Script the value returned by `read`.
    pub fn set_value(&self, value: Vec<u8>) {
        *self.value.lock().expect("mock poisoned") = value;
    }

    /// Payloads written so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().expect("mock poisoned").clone()
    }

    /// Make `read` fail.
    pub fn fail_read(&self, fail: bool) {
        self.fail_read.store(fail, Ordering::SeqCst);
    }

    /// Make `subscribe` fail.
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Push a notification to every live subscriber.
    pub fn notify(&self, payload: Vec<u8>) {
        self.subscribers
            .lock()
            .expect("mock poisoned")
            .retain(|tx| tx.send(payload.clone()).is_ok());
    }

    /// Number of `subscribe` invocations so far.
    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of `unsubscribe` invocations so far.
    pub fn unsubscribe_calls(&self) -> u32 {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Characteristic for MockCharacteristic {
    async fn read(&self) -> Result<Vec<u8>> {
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        Ok(self.value.lock().expect("mock poisoned").clone())
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.writes
            .lock()
            .expect("mock poisoned")
            .push(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("mock poisoned").push(tx);
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        })))
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().expect("mock poisoned").clear();
        Ok(())
    }
}

/// Recording publisher for tests.
#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<PublishedMeasurement>>,
    capabilities: Mutex<Vec<(SensorAddress, &'static str)>>,
}

impl MockPublisher {
    /// Everything published so far.
    pub fn published(&self) -> Vec<PublishedMeasurement> {
        self.published.lock().expect("mock poisoned").clone()
    }

    /// Measurements published for one capability name.
    pub fn published_for(&self, capability: &str) -> Vec<Measurement> {
        self.published
            .lock()
            .expect("mock poisoned")
            .iter()
            .filter(|p| p.measurement.capability() == capability)
            .map(|p| p.measurement)
            .collect()
    }

    /// Capabilities registered so far.
    pub fn capabilities(&self) -> Vec<(SensorAddress, &'static str)> {
        self.capabilities.lock().expect("mock poisoned").clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, address: &SensorAddress, measurement: Measurement) {
        self.published
            .lock()
            .expect("mock poisoned")
            .push(PublishedMeasurement {
                address: address.clone(),
                measurement,
            });
    }

    async fn ensure_capability(&self, address: &SensorAddress, capability: Capability) {
        let mut capabilities = self.capabilities.lock().expect("mock poisoned");
        let entry = (address.clone(), capability.name());
        if !capabilities.contains(&entry) {
            capabilities.push(entry);
        }
    }
}

/// Recording warning sink for tests.
#[derive(Default)]
pub struct MockWarningSink {
    current: Mutex<HashMap<SensorAddress, String>>,
    history: Mutex<Vec<(SensorAddress, Option<String>)>>,
}

impl MockWarningSink {
    /// The warning currently shown for a peripheral, if any.
    pub fn current(&self, address: &SensorAddress) -> Option<String> {
        self.current
            .lock()
            .expect("mock poisoned")
            .get(address)
            .cloned()
    }

    /// Every set/clear call so far.
    pub fn history(&self) -> Vec<(SensorAddress, Option<String>)> {
        self.history.lock().expect("mock poisoned").clone()
    }
}

#[async_trait]
impl WarningSink for MockWarningSink {
    async fn set_warning(&self, address: &SensorAddress, message: Option<String>) {
        self.history
            .lock()
            .expect("mock poisoned")
            .push((address.clone(), message.clone()));
        let mut current = self.current.lock().expect("mock poisoned");
        match message {
            Some(message) => {
                current.insert(address.clone(), message);
            }
            None => {
                current.remove(address);
            }
        }
    }
}
