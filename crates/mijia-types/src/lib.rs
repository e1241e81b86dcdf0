//! Platform-agnostic types for Xiaomi Mijia BLE thermometers.
//!
//! This crate provides the shared vocabulary used by the BLE client
//! (mijia-core) and anything that consumes its published readings.
//!
//! # Features
//!
//! - Sensor kinds and their GATT wiring
//! - Normalized peripheral addresses
//! - Decoded readings and per-kind plausibility bounds
//! - UUID constants for BLE services and characteristics
//! - Error types for payload decoding
//!
//! # Example
//!
//! ```
//! use mijia_types::{Reading, SensorAddress, SensorKind};
//!
//! let address = SensorAddress::new("A4:C1:38:0D:EE:FF");
//! let kind = SensorKind::from_name("LYWSD03MMC").unwrap();
//! assert!(kind.data_service().is_some());
//! assert!(Reading::default().is_empty());
//! # let _ = address;
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{Reading, SensorAddress, SensorKind, ValidRanges};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;

    // Cross-module checks that the kind wiring points at the published
    // UUID constants; per-module behavior is tested next to each module.

    #[test]
    fn test_lywsd_kinds_share_data_service() {
        assert_eq!(
            SensorKind::Lywsd02.data_service(),
            SensorKind::Lywsd03.data_service()
        );
        assert_eq!(
            SensorKind::Lywsd02.data_service(),
            Some(uuid::LYWSD_DATA_SERVICE)
        );
    }

    #[test]
    fn test_lywsd02_battery_is_vendor_characteristic() {
        let (service, characteristic) = SensorKind::Lywsd02.battery_characteristic().unwrap();
        assert_eq!(service, uuid::LYWSD_DATA_SERVICE);
        assert_eq!(characteristic, uuid::LYWSD_BATTERY);
    }

    #[test]
    fn test_lywsdcgq_battery_is_standard_service() {
        let (service, characteristic) = SensorKind::Lywsdcgq.battery_characteristic().unwrap();
        assert_eq!(service, uuid::BATTERY_SERVICE);
        assert_eq!(characteristic, uuid::BATTERY_LEVEL);
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::InsufficientBytes {
            expected: 3,
            actual: 1,
        };
        assert!(err.to_string().contains("expected 3 bytes"));
        assert!(err.to_string().contains("got 1"));
    }
}
