//! Core types for Mijia sensor data.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Kind of Mijia thermometer.
///
/// The kind selects the wire format of the notification payload and the
/// plausibility bounds applied to decoded values. It is configured per
/// device when the device is paired, never inferred from the payload.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new device kinds
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum SensorKind {
    /// LYWSD02MMC clock display, binary little-endian notifications.
    Lywsd02,
    /// LYWSD03MMC square sensor (stock firmware), binary little-endian
    /// notifications that also carry the cell voltage.
    Lywsd03,
    /// LYWSDCGQ/01ZM round sensor, ASCII `T=.. H=..` notifications.
    Lywsdcgq,
    /// LYWSD03MMC with ATC custom firmware, broadcast-only: readings are
    /// carried in the `181a` advertisement service data.
    AtcMijia,
}

impl SensorKind {
    /// Detect the sensor kind from an advertised local name.
    ///
    /// # Examples
    ///
    /// ```
    /// use mijia_types::SensorKind;
    ///
    /// assert_eq!(SensorKind::from_name("LYWSD03MMC"), Some(SensorKind::Lywsd03));
    /// assert_eq!(SensorKind::from_name("ATC_A1B2C3"), Some(SensorKind::AtcMijia));
    /// assert_eq!(SensorKind::from_name("MJ_HT_V1"), Some(SensorKind::Lywsdcgq));
    /// assert_eq!(SensorKind::from_name("Unknown Device"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_uppercase();
        if name.starts_with("ATC") {
            return Some(SensorKind::AtcMijia);
        }
        if name.contains("LYWSD03") {
            return Some(SensorKind::Lywsd03);
        }
        if name.contains("LYWSD02") {
            return Some(SensorKind::Lywsd02);
        }
        if name.contains("LYWSDCGQ") || name.contains("MJ_HT_V1") {
            return Some(SensorKind::Lywsdcgq);
        }
        None
    }

    /// GATT service holding the temperature/humidity characteristic.
    ///
    /// `None` for broadcast-only kinds that are never connected to.
    #[must_use]
    pub fn data_service(&self) -> Option<uuid::Uuid> {
        match self {
            SensorKind::Lywsd02 | SensorKind::Lywsd03 => Some(crate::uuid::LYWSD_DATA_SERVICE),
            SensorKind::Lywsdcgq => Some(crate::uuid::LYWSDCGQ_DATA_SERVICE),
            SensorKind::AtcMijia => None,
        }
    }

    /// Notification characteristic carrying temperature/humidity payloads.
    #[must_use]
    pub fn data_characteristic(&self) -> Option<uuid::Uuid> {
        match self {
            SensorKind::Lywsd02 | SensorKind::Lywsd03 => Some(crate::uuid::LYWSD_DATA),
            SensorKind::Lywsdcgq => Some(crate::uuid::LYWSDCGQ_DATA),
            SensorKind::AtcMijia => None,
        }
    }

    /// Service/characteristic pair for the one-shot battery read.
    #[must_use]
    pub fn battery_characteristic(&self) -> Option<(uuid::Uuid, uuid::Uuid)> {
        match self {
            SensorKind::Lywsd02 => {
                Some((crate::uuid::LYWSD_DATA_SERVICE, crate::uuid::LYWSD_BATTERY))
            }
            // LYWSD03 battery arrives with every notification (voltage field)
            SensorKind::Lywsd03 => None,
            SensorKind::Lywsdcgq => {
                Some((crate::uuid::BATTERY_SERVICE, crate::uuid::BATTERY_LEVEL))
            }
            SensorKind::AtcMijia => None,
        }
    }

    /// Service/characteristic pair that must be written `[0x01, 0x00]`
    /// before the sensor starts notifying, if this kind needs it.
    #[must_use]
    pub fn notify_enable(&self) -> Option<(uuid::Uuid, uuid::Uuid)> {
        match self {
            SensorKind::Lywsd02 => Some((crate::uuid::LYWSD_DATA_SERVICE, crate::uuid::LYWSD_DATA)),
            SensorKind::Lywsdcgq => Some((
                crate::uuid::LEGACY_PAIRING_SERVICE,
                crate::uuid::LEGACY_NOTIFY_ENABLE,
            )),
            SensorKind::Lywsd03 | SensorKind::AtcMijia => None,
        }
    }

    /// Plausibility bounds for decoded readings of this kind.
    #[must_use]
    pub fn ranges(&self) -> ValidRanges {
        // All BLE variants shipped with the same bounds; kept per-kind so
        // hardware with wider tolerances can diverge without touching the
        // decoder.
        ValidRanges::default()
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Lywsd02 => write!(f, "LYWSD02MMC"),
            SensorKind::Lywsd03 => write!(f, "LYWSD03MMC"),
            SensorKind::Lywsdcgq => write!(f, "LYWSDCGQ/01ZM"),
            SensorKind::AtcMijia => write!(f, "ATC LYWSD03MMC"),
        }
    }
}

impl FromStr for SensorKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lywsd02" | "lywsd02mmc" => Ok(SensorKind::Lywsd02),
            "lywsd03" | "lywsd03mmc" => Ok(SensorKind::Lywsd03),
            "lywsdcgq" | "lywsdcgq/01zm" => Ok(SensorKind::Lywsdcgq),
            "atc" | "atc-mijia" => Ok(SensorKind::AtcMijia),
            other => Err(ParseError::InvalidValue(format!(
                "unknown sensor kind '{other}'"
            ))),
        }
    }
}

/// Normalized identity of a BLE peripheral: lowercase hex, no separators.
///
/// Built from whatever the platform hands out — a `AA:BB:CC:DD:EE:FF` MAC
/// on Linux/Windows, a CoreBluetooth UUID on macOS — and immutable once the
/// device is paired.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SensorAddress(String);

impl SensorAddress {
    /// Normalize a raw platform identifier into a sensor address.
    ///
    /// # Examples
    ///
    /// ```
    /// use mijia_types::SensorAddress;
    ///
    /// let addr = SensorAddress::new("A4:C1:38:0D:EE:FF");
    /// assert_eq!(addr.as_str(), "a4c1380deeff");
    /// ```
    #[must_use]
    pub fn new(raw: &str) -> Self {
        let normalized = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        Self(normalized)
    }

    /// The normalized address text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SensorAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = Self::new(s);
        if addr.0.is_empty() {
            return Err(ParseError::InvalidValue(format!(
                "'{s}' contains no address characters"
            )));
        }
        Ok(addr)
    }
}

/// One decoded set of sensor values.
///
/// Every field is independently optional: a notification may carry only
/// temperature/humidity, the battery may come from a separate read, and
/// RSSI is sampled from the advertisement. Readings are transient — they
/// are produced per notification and published, never stored here.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Temperature in degrees Celsius, offset already applied.
    pub temperature: Option<f32>,
    /// Relative humidity percentage.
    pub humidity: Option<f32>,
    /// Battery level percentage (0-100).
    pub battery: Option<u8>,
    /// Battery cell voltage in volts (LYWSD03 only).
    pub voltage: Option<f32>,
    /// Signal strength in dBm at the time the advertisement was seen.
    pub rssi: Option<i16>,
}

impl Reading {
    /// True when no field carries a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.battery.is_none()
            && self.voltage.is_none()
            && self.rssi.is_none()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = self.temperature {
            parts.push(format!("{t:.2}°C"));
        }
        if let Some(h) = self.humidity {
            parts.push(format!("{h:.0}%"));
        }
        if let Some(b) = self.battery {
            parts.push(format!("battery {b}%"));
        }
        if let Some(v) = self.voltage {
            parts.push(format!("{v:.3}V"));
        }
        if let Some(r) = self.rssi {
            parts.push(format!("{r} dBm"));
        }
        if parts.is_empty() {
            return f.write_str("(empty)");
        }
        f.write_str(&parts.join(", "))
    }
}

/// Plausibility bounds applied to decoded readings.
///
/// Values outside these bounds are dropped before publication — a policy,
/// not an error. Bounds differ per hardware variant, so they travel with
/// the [`SensorKind`] rather than living in the decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValidRanges {
    /// Minimum plausible temperature (°C).
    pub temperature_min: f32,
    /// Maximum plausible temperature (°C).
    pub temperature_max: f32,
    /// Minimum plausible humidity (%).
    pub humidity_min: f32,
    /// Maximum plausible humidity (%).
    pub humidity_max: f32,
}

impl Default for ValidRanges {
    fn default() -> Self {
        Self {
            temperature_min: -20.0,
            temperature_max: 50.0,
            humidity_min: 10.0,
            humidity_max: 99.0,
        }
    }
}

impl ValidRanges {
    /// Create bounds with the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds used by mains-powered or fractional-humidity hardware:
    /// 0-100 % humidity and a slightly wider cold end.
    #[must_use]
    pub fn wide_humidity() -> Self {
        Self {
            temperature_min: -30.0,
            temperature_max: 50.0,
            humidity_min: 0.0,
            humidity_max: 100.0,
        }
    }

    /// Set the temperature bounds (°C).
    #[must_use]
    pub fn temperature(mut self, min: f32, max: f32) -> Self {
        self.temperature_min = min;
        self.temperature_max = max;
        self
    }

    /// Set the humidity bounds (%).
    #[must_use]
    pub fn humidity(mut self, min: f32, max: f32) -> Self {
        self.humidity_min = min;
        self.humidity_max = max;
        self
    }

    /// Check a temperature against the bounds.
    #[must_use]
    pub fn temperature_ok(&self, value: f32) -> bool {
        value >= self.temperature_min && value <= self.temperature_max
    }

    /// Check a humidity against the bounds.
    #[must_use]
    pub fn humidity_ok(&self, value: f32) -> bool {
        value >= self.humidity_min && value <= self.humidity_max
    }
}
