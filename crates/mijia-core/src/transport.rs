//! Abstract BLE transport consumed by the session layer.
//!
//! The session, poll and discovery modules never touch a BLE stack
//! directly — they speak to these object-safe traits. Production code
//! adapts btleplug through [`crate::btle::BtleTransport`]; tests drive the
//! same code paths with [`crate::mock::MockTransport`].
//!
//! The operation set mirrors what a host BLE layer offers a plugin:
//! resolve an advertisement by address, run a timed discovery, connect,
//! walk services and characteristics, read/write/subscribe, and observe
//! disconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use uuid::Uuid;

use mijia_types::SensorAddress;

use crate::error::Result;

/// Advertisement fields used for discovery-time classification.
///
/// `service_uuids` and service-data keys are kept as the raw advertised
/// strings: platforms disagree on whether they hand out 16-bit short forms
/// or full 128-bit UUIDs, and the discovery filter normalizes on compare.
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
    /// Normalized peripheral address.
    pub address: SensorAddress,
    /// Advertised local name, if the packet carried one.
    pub local_name: Option<String>,
    /// Advertised service UUIDs, as advertised (short or long form).
    pub service_uuids: Vec<String>,
    /// Service-data entries: advertised UUID string and payload.
    pub service_data: Vec<(String, Vec<u8>)>,
    /// Signal strength at the time the advertisement was received.
    pub rssi: Option<i16>,
}

impl AdvertisementRecord {
    /// Create a record with just an address; the rest defaults to empty.
    #[must_use]
    pub fn new(address: SensorAddress) -> Self {
        Self {
            address,
            local_name: None,
            service_uuids: Vec::new(),
            service_data: Vec::new(),
            rssi: None,
        }
    }
}

/// Entry point into the BLE stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve a peripheral by its normalized address.
    async fn find_by_address(&self, address: &SensorAddress) -> Result<Arc<dyn Advertisement>>;

    /// Run a timed scan and return every advertisement seen.
    ///
    /// `filter` restricts the scan to peripherals advertising one of the
    /// given services when non-empty; an empty filter scans everything.
    async fn discover(
        &self,
        filter: &[Uuid],
        duration: Duration,
    ) -> Result<Vec<AdvertisementRecord>>;
}

/// A resolved advertisement: the handle used to open a connection.
#[async_trait]
pub trait Advertisement: Send + Sync {
    /// Signal strength sampled when the advertisement was received.
    fn rssi(&self) -> Option<i16>;

    /// The discovery-time record for this peripheral.
    fn record(&self) -> AdvertisementRecord;

    /// Open a connection.
    ///
    /// The returned handle is owned by exactly one session and becomes
    /// invalid after [`Peripheral::disconnect`]; it must not be reused.
    async fn connect(&self) -> Result<Arc<dyn Peripheral>>;
}

/// An open connection to a peripheral.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Look up a GATT service by UUID.
    async fn service(&self, uuid: Uuid) -> Result<Arc<dyn Service>>;

    /// Close the connection. Best-effort; the handle is dead afterwards.
    async fn disconnect(&self) -> Result<()>;

    /// Receiver signalled when the peripheral drops the connection.
    fn disconnect_events(&self) -> broadcast::Receiver<()>;
}

/// A GATT service on a connected peripheral.
#[async_trait]
pub trait Service: Send + Sync {
    /// Look up a characteristic by UUID.
    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn Characteristic>>;
}

/// A GATT characteristic, readable and/or subscribable.
#[async_trait]
pub trait Characteristic: Send + Sync {
    /// Read the current value.
    async fn read(&self) -> Result<Vec<u8>>;

    /// Write a value.
    async fn write(&self, payload: &[u8]) -> Result<()>;

    /// Subscribe to notifications; items are raw payloads.
    ///
    /// The stream ends when the peripheral disconnects or the
    /// subscription is torn down.
    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Best-effort unsubscribe; failures are not fatal to teardown.
    async fn unsubscribe(&self) -> Result<()>;
}
