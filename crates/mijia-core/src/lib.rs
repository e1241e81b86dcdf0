//! BLE session management for Xiaomi Mijia thermometers.
//!
//! This crate owns the connect/subscribe/poll cycle for low-power BLE
//! temperature and humidity sensors (LYWSD02MMC, LYWSD03MMC,
//! LYWSDCGQ/01ZM, ATC custom firmware).
//!
//! # Architecture
//!
//! - **Payload decoding** ([`decode`]): pure per-kind decoders from raw
//!   bytes to validated readings.
//! - **Peripheral session** ([`session`]): one connect → discover →
//!   subscribe → publish → disconnect cycle per device, with an explicit
//!   state machine and a reentrancy guard.
//! - **Watchdog** ([`watchdog`]): converts a silently-stopped peripheral
//!   into an explicit teardown.
//! - **Poll scheduler** ([`poll`]): the supervising retry cadence.
//! - **Discovery** ([`discovery`]): pairing-time classification plus a
//!   coalescing, caching discovery front.
//! - **Transport** ([`transport`]): the abstract BLE surface; backed by
//!   btleplug in production ([`btle`]) and by [`mock`] in tests.
//! - **Publication** ([`publish`]): measurement and warning sinks the
//!   host plugs into.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mijia_core::btle::BtleTransport;
//! use mijia_core::publish::{ChannelPublisher, LogWarningSink};
//! use mijia_core::session::{PeripheralSession, SessionConfig};
//! use mijia_types::{SensorAddress, SensorKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleTransport::new().await?);
//!     let publisher = Arc::new(ChannelPublisher::default());
//!     let mut readings = publisher.subscribe();
//!
//!     let session = PeripheralSession::new(
//!         SensorAddress::new("A4:C1:38:0D:EE:FF"),
//!         SessionConfig::new(SensorKind::Lywsd03),
//!         transport,
//!         publisher,
//!         Arc::new(LogWarningSink),
//!     );
//!     session.start().await?;
//!
//!     while let Ok(published) = readings.recv().await {
//!         println!("{}: {:?}", published.address, published.measurement);
//!     }
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod decode;
pub mod discovery;
pub mod error;
pub mod mock;
pub mod poll;
pub mod publish;
pub mod session;
pub mod settings;
pub mod transport;
pub mod watchdog;

pub use error::{DeviceNotFoundReason, Error, Result};

// Core exports
pub use discovery::{DeviceFilter, DiscoveryOptions, SharedDiscovery};
pub use poll::PollScheduler;
pub use publish::{
    Capability, ChannelPublisher, Measurement, PublishedMeasurement, Publisher, WarningClass,
    WarningSink,
};
pub use session::{PeripheralSession, SessionConfig, SessionState};
pub use settings::{DEFAULT_POLL_INTERVAL, SensorSettings};
pub use transport::{Advertisement, AdvertisementRecord, Characteristic, Transport};
pub use watchdog::{DEFAULT_WATCHDOG_TIMEOUT, Watchdog, WatchdogState};

// Re-export from mijia-types
pub use mijia_types::{Reading, SensorAddress, SensorKind, ValidRanges, uuids};
