//! Decoding Mijia notification payloads.
//!
//! Pure functions turning raw characteristic/advertisement bytes into
//! [`Reading`]s. The wire format is selected by [`SensorKind`] — the same
//! bytes mean different things on different hardware, so the format is
//! never inferred from the payload itself.
//!
//! Decode failures are reported as [`ParseError`] and only ever skip the
//! offending reading; plausibility checks ([`validate`]) silently drop
//! individual fields instead of erroring.

use bytes::Buf;
use tracing::debug;

use mijia_types::{ParseError, ParseResult, Reading, SensorKind, ValidRanges};

/// Minimum notification length for the LYWSD02/LYWSD03 binary format.
pub const MIN_LYWSD_PAYLOAD_BYTES: usize = 3;

/// Notification length at which the LYWSD03 voltage field is present.
pub const LYWSD_VOLTAGE_PAYLOAD_BYTES: usize = 5;

/// Minimum service-data length for the ATC advertisement format.
pub const MIN_ATC_PAYLOAD_BYTES: usize = 10;

/// Decode a notification payload for the given sensor kind.
///
/// `temperature_offset` is a user calibration in °C, applied after the
/// wire value is scaled; it may be negative.
pub fn decode(kind: SensorKind, data: &[u8], temperature_offset: f32) -> ParseResult<Reading> {
    match kind {
        SensorKind::Lywsd02 | SensorKind::Lywsd03 => decode_lywsd(data, temperature_offset),
        SensorKind::Lywsdcgq => decode_ascii(data, temperature_offset),
        SensorKind::AtcMijia => decode_atc_advertisement(data, temperature_offset),
        // `SensorKind` is `#[non_exhaustive]`; all known kinds are handled above.
        _ => unreachable!("unhandled SensorKind variant"),
    }
}

/// Decode the LYWSD02MMC/LYWSD03MMC binary notification.
///
/// Format (3 or 5 bytes):
/// - bytes 0-1: temperature (i16 LE, /100 for °C)
/// - byte 2: humidity (u8, percent)
/// - bytes 3-4: cell voltage (u16 LE, millivolts; LYWSD03 only)
pub fn decode_lywsd(data: &[u8], temperature_offset: f32) -> ParseResult<Reading> {
    if data.len() < MIN_LYWSD_PAYLOAD_BYTES {
        return Err(ParseError::InsufficientBytes {
            expected: MIN_LYWSD_PAYLOAD_BYTES,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let temp_raw = buf.get_i16_le();
    let humidity = buf.get_u8();

    let (voltage, battery) = if data.len() >= LYWSD_VOLTAGE_PAYLOAD_BYTES {
        let volts = f32::from(buf.get_u16_le()) / 1000.0;
        (Some(volts), Some(battery_from_voltage(volts)))
    } else {
        (None, None)
    };

    Ok(Reading {
        temperature: Some(f32::from(temp_raw) / 100.0 + temperature_offset),
        humidity: Some(f32::from(humidity)),
        battery,
        voltage,
        rssi: None,
    })
}

/// Decode the LYWSDCGQ/01ZM ASCII notification (`T=23.4 H=45.6`).
pub fn decode_ascii(data: &[u8], temperature_offset: f32) -> ParseResult<Reading> {
    let text = core::str::from_utf8(data)
        .map_err(|_| ParseError::PatternMismatch("payload is not ASCII".to_string()))?;
    let text = text.trim_matches('\0').trim();

    let mut temperature = None;
    let mut humidity = None;
    for token in text.split_whitespace() {
        if let Some(value) = token.strip_prefix("T=") {
            temperature = value.parse::<f32>().ok();
        } else if let Some(value) = token.strip_prefix("H=") {
            humidity = value.parse::<f32>().ok();
        }
    }

    match (temperature, humidity) {
        (Some(t), Some(h)) => Ok(Reading {
            temperature: Some(t + temperature_offset),
            humidity: Some(h),
            battery: None,
            voltage: None,
            rssi: None,
        }),
        _ => Err(ParseError::PatternMismatch(text.to_string())),
    }
}

/// Decode the ATC custom-firmware service-data payload (`181a` service).
///
/// Format (10 bytes minimum):
/// - bytes 0-5: peripheral MAC
/// - bytes 6-7: temperature (i16 BE, /10 for °C)
/// - byte 8: humidity (u8, percent)
/// - byte 9: battery (u8, percent)
pub fn decode_atc_advertisement(data: &[u8], temperature_offset: f32) -> ParseResult<Reading> {
    if data.len() < MIN_ATC_PAYLOAD_BYTES {
        return Err(ParseError::InsufficientBytes {
            expected: MIN_ATC_PAYLOAD_BYTES,
            actual: data.len(),
        });
    }

    let temp_raw = i16::from_be_bytes([data[6], data[7]]);
    let humidity = data[8];
    let battery = data[9];

    Ok(Reading {
        temperature: Some(f32::from(temp_raw) / 10.0 + temperature_offset),
        humidity: Some(f32::from(humidity)),
        battery: Some(battery),
        voltage: None,
        rssi: None,
    })
}

/// Decode a one-shot battery characteristic read: a single percentage byte.
pub fn decode_battery_level(data: &[u8]) -> ParseResult<u8> {
    if data.is_empty() {
        return Err(ParseError::InsufficientBytes {
            expected: 1,
            actual: 0,
        });
    }
    Ok(data[0])
}

/// Map a cell voltage to a battery percentage.
///
/// Linear over the usable CR2032 range: 2.1 V empty, 3.0 V full.
#[must_use]
pub fn battery_from_voltage(volts: f32) -> u8 {
    let percent = (volts - 2.1) / 0.9 * 100.0;
    percent.round().clamp(0.0, 100.0) as u8
}

/// Map an RSSI in dBm onto a 0-100 % signal scale.
#[must_use]
pub fn rssi_percent(rssi: i16) -> u8 {
    let percent = (f32::from(rssi) + 100.0) / 60.0 * 100.0;
    percent.round().clamp(0.0, 100.0) as u8
}

/// Apply plausibility bounds, dropping out-of-range fields.
///
/// Dropped fields are logged and omitted from the result — an out-of-range
/// value is a policy decision, never an error.
#[must_use]
pub fn validate(reading: Reading, ranges: &ValidRanges) -> Reading {
    let mut out = reading;

    if let Some(t) = out.temperature
        && !ranges.temperature_ok(t)
    {
        debug!(temperature = t, "ignoring implausible temperature reading");
        out.temperature = None;
    }

    if let Some(h) = out.humidity
        && !ranges.humidity_ok(h)
    {
        debug!(humidity = h, "ignoring implausible humidity reading");
        out.humidity = None;
    }

    if let Some(b) = out.battery
        && b > 100
    {
        debug!(battery = b, "ignoring implausible battery reading");
        out.battery = None;
    }

    out
}
