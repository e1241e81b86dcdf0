//! btleplug-backed implementation of the transport traits.
//!
//! This is the only module that touches a real BLE stack. Everything
//! above it (session, poll, discovery) speaks the traits in
//! [`crate::transport`], so none of this code runs in unit tests.
//!
//! Platform note: on Linux/Windows peripherals are identified by MAC
//! address; on macOS CoreBluetooth hands out a per-host UUID instead, so
//! address resolution matches against both forms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mijia_types::SensorAddress;

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::transport::{
    Advertisement, AdvertisementRecord, Characteristic, Peripheral, Service, Transport,
};

/// Scan attempts made while resolving a peripheral by address.
const FIND_ATTEMPTS: u32 = 3;

/// Base scan duration per resolve attempt; attempt N scans N times this.
const FIND_BASE_DURATION: Duration = Duration::from_secs(2);

/// BLE transport over the first available system adapter.
pub struct BtleTransport {
    adapter: Adapter,
}

impl BtleTransport {
    /// Acquire the first available Bluetooth adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))?;
        Ok(Self { adapter })
    }

    /// Wrap a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Search known peripherals for one matching the address.
    async fn known_peripheral(&self, address: &SensorAddress) -> Result<Option<PlatformPeripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                let mac = SensorAddress::new(&properties.address.to_string());
                let id = SensorAddress::new(&peripheral.id().to_string());
                // MAC on Linux/Windows, CoreBluetooth UUID on macOS
                if (mac.as_str() != "000000000000" && mac == *address) || id == *address {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn find_by_address(&self, address: &SensorAddress) -> Result<Arc<dyn Advertisement>> {
        debug!(%address, "resolving peripheral");

        // Already known from a previous scan?
        if let Some(peripheral) = self.known_peripheral(address).await? {
            debug!(%address, "peripheral known, no scan needed");
            return advertisement_for(&self.adapter, peripheral).await;
        }

        // Advertisements are easy to miss; retry with growing scan windows.
        for attempt in 1..=FIND_ATTEMPTS {
            let duration = FIND_BASE_DURATION * attempt;
            debug!(%address, attempt, ?duration, "scan attempt");

            self.adapter.start_scan(ScanFilter::default()).await?;
            sleep(duration).await;
            self.adapter.stop_scan().await?;

            if let Some(peripheral) = self.known_peripheral(address).await? {
                info!(%address, attempt, "peripheral found");
                return advertisement_for(&self.adapter, peripheral).await;
            }
        }

        warn!(%address, "peripheral not found after {FIND_ATTEMPTS} attempts");
        Err(Error::device_not_found(address.as_str()))
    }

    async fn discover(
        &self,
        filter: &[Uuid],
        duration: Duration,
    ) -> Result<Vec<AdvertisementRecord>> {
        info!(?duration, "starting BLE discovery");
        let scan_filter = ScanFilter {
            services: filter.to_vec(),
        };

        self.adapter.start_scan(scan_filter).await?;
        sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut records = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            match peripheral.properties().await {
                Ok(Some(properties)) => {
                    let record = AdvertisementRecord {
                        address: SensorAddress::new(&properties.address.to_string()),
                        local_name: properties.local_name.clone(),
                        service_uuids: properties
                            .services
                            .iter()
                            .map(Uuid::to_string)
                            .collect(),
                        service_data: properties
                            .service_data
                            .iter()
                            .map(|(uuid, data)| (uuid.to_string(), data.clone()))
                            .collect(),
                        rssi: properties.rssi,
                    };
                    records.push(record);
                }
                Ok(None) => {}
                Err(error) => debug!(%error, "skipping peripheral without properties"),
            }
        }

        info!(count = records.len(), "discovery complete");
        Ok(records)
    }
}

/// Build the advertisement handle for a resolved peripheral.
async fn advertisement_for(
    adapter: &Adapter,
    peripheral: PlatformPeripheral,
) -> Result<Arc<dyn Advertisement>> {
    let properties = peripheral.properties().await?;
    let record = match properties {
        Some(properties) => AdvertisementRecord {
            address: SensorAddress::new(&properties.address.to_string()),
            local_name: properties.local_name.clone(),
            service_uuids: properties.services.iter().map(Uuid::to_string).collect(),
            service_data: properties
                .service_data
                .iter()
                .map(|(uuid, data)| (uuid.to_string(), data.clone()))
                .collect(),
            rssi: properties.rssi,
        },
        None => AdvertisementRecord::new(SensorAddress::new(&peripheral.id().to_string())),
    };

    Ok(Arc::new(BtleAdvertisement {
        adapter: adapter.clone(),
        peripheral,
        record,
    }))
}

struct BtleAdvertisement {
    adapter: Adapter,
    peripheral: PlatformPeripheral,
    record: AdvertisementRecord,
}

#[async_trait]
impl Advertisement for BtleAdvertisement {
    fn rssi(&self) -> Option<i16> {
        self.record.rssi
    }

    fn record(&self) -> AdvertisementRecord {
        self.record.clone()
    }

    async fn connect(&self) -> Result<Arc<dyn Peripheral>> {
        self.peripheral.connect().await?;
        self.peripheral.discover_services().await?;

        let (disconnect_tx, _) = broadcast::channel(4);
        let watcher = spawn_disconnect_watcher(
            &self.adapter,
            self.peripheral.id(),
            disconnect_tx.clone(),
        )
        .await?;

        Ok(Arc::new(BtlePeripheral {
            peripheral: self.peripheral.clone(),
            disconnect_tx,
            watcher,
        }))
    }
}

/// Forward the adapter's disconnect event for one peripheral onto a
/// broadcast channel. The task ends after the first matching event.
async fn spawn_disconnect_watcher(
    adapter: &Adapter,
    id: PeripheralId,
    tx: broadcast::Sender<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut events = adapter.events().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(disconnected) = event
                && disconnected == id
            {
                debug!(?id, "adapter reported disconnect");
                let _ = tx.send(());
                break;
            }
        }
    }))
}

struct BtlePeripheral {
    peripheral: PlatformPeripheral,
    disconnect_tx: broadcast::Sender<()>,
    watcher: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Peripheral for BtlePeripheral {
    async fn service(&self, uuid: Uuid) -> Result<Arc<dyn Service>> {
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|service| service.uuid == uuid)
            .ok_or_else(|| Error::service_not_found(uuid))?;

        Ok(Arc::new(BtleService {
            peripheral: self.peripheral.clone(),
            service,
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn disconnect_events(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }
}

impl Drop for BtlePeripheral {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

struct BtleService {
    peripheral: PlatformPeripheral,
    service: btleplug::api::Service,
}

#[async_trait]
impl Service for BtleService {
    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn Characteristic>> {
        let characteristic = self
            .service
            .characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(uuid))?;

        Ok(Arc::new(BtleCharacteristic {
            peripheral: self.peripheral.clone(),
            characteristic,
        }))
    }
}

struct BtleCharacteristic {
    peripheral: PlatformPeripheral,
    characteristic: btleplug::api::Characteristic,
}

#[async_trait]
impl Characteristic for BtleCharacteristic {
    async fn read(&self) -> Result<Vec<u8>> {
        Ok(self.peripheral.read(&self.characteristic).await?)
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        self.peripheral.subscribe(&self.characteristic).await?;
        let uuid = self.characteristic.uuid;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |notification| {
                futures::future::ready(
                    (notification.uuid == uuid).then_some(notification.value),
                )
            })
            .boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.peripheral.unsubscribe(&self.characteristic).await?;
        Ok(())
    }
}
