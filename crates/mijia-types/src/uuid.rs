//! Bluetooth UUIDs for Xiaomi Mijia thermometers.
//!
//! This module contains all the UUIDs needed to discover and communicate
//! with Mijia temperature/humidity sensors over Bluetooth Low Energy, plus
//! helpers for comparing the 16-bit short forms found in advertisements
//! against full 128-bit UUIDs.

use uuid::{Uuid, uuid};

// --- Advertisement service UUIDs ---

/// Environmental Sensing service advertised by ATC-flavored firmware.
///
/// Appears in advertisements both as the short form `181a` and as the
/// full 128-bit UUID; use [`matches`] when classifying records.
pub const ADVERTISEMENT_SERVICE: Uuid = uuid!("0000181a-0000-1000-8000-00805f9b34fb");

/// Xiaomi legacy pairing service (stock LYWSDCGQ firmware).
pub const LEGACY_PAIRING_SERVICE: Uuid = uuid!("0000fe95-0000-1000-8000-00805f9b34fb");

/// Notify-enable characteristic on the legacy pairing service.
pub const LEGACY_NOTIFY_ENABLE: Uuid = uuid!("00000010-0000-1000-8000-00805f9b34fb");

// --- LYWSD02 / LYWSD03 GATT UUIDs ---

/// Temperature/humidity service on LYWSD02MMC and LYWSD03MMC.
pub const LYWSD_DATA_SERVICE: Uuid = uuid!("ebe0ccb0-7a0a-4b0c-8a1a-6ff2997da3a6");

/// Temperature/humidity notification characteristic.
pub const LYWSD_DATA: Uuid = uuid!("ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6");

/// One-shot battery percentage characteristic.
pub const LYWSD_BATTERY: Uuid = uuid!("ebe0ccc4-7a0a-4b0c-8a1a-6ff2997da3a6");

// --- LYWSDCGQ GATT UUIDs ---

/// Temperature/humidity service on LYWSDCGQ/01ZM.
pub const LYWSDCGQ_DATA_SERVICE: Uuid = uuid!("226c0000-6476-4566-7562-66734470666d");

/// ASCII `T=.. H=..` notification characteristic.
pub const LYWSDCGQ_DATA: Uuid = uuid!("226caa55-6476-4566-7562-66734470666d");

// --- Standard BLE Service UUIDs ---

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Firmware revision string characteristic.
pub const FIRMWARE_REVISION: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");

/// Standard battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

/// Standard battery level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

/// Suffix shared by every 16-bit UUID expanded onto the Bluetooth base.
const BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Expand a 16-bit short-form UUID string (e.g. `"181a"`) to a full UUID.
///
/// Returns `None` when the input is not exactly four hex digits.
#[must_use]
pub fn expand_short(short: &str) -> Option<Uuid> {
    if short.len() != 4 || !short.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let full = format!("0000{}{}", short.to_lowercase(), BASE_SUFFIX);
    Uuid::parse_str(&full).ok()
}

/// Normalize an advertised UUID string: lowercase, punctuation stripped.
#[must_use]
pub fn normalize(advertised: &str) -> String {
    advertised
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Check whether an advertised UUID string refers to `expected`.
///
/// Accepts both the 16-bit short form and the 128-bit long form, in any
/// hyphenation or case the advertisement happened to use.
#[must_use]
pub fn matches(expected: Uuid, advertised: &str) -> bool {
    let normalized = normalize(advertised);
    if normalized.len() == 4 {
        return expand_short(&normalized) == Some(expected);
    }
    Uuid::parse_str(&normalized).is_ok_and(|u| u == expected)
}
