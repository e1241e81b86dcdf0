//! End-to-end tests for the session cycle over the mock transport.
//!
//! These exercise the full connect → subscribe → decode → publish →
//! disconnect path without BLE hardware, including the failure policies:
//! duplicate suppression, range validation, the reentrancy guard and the
//! watchdog teardown.

use std::sync::Arc;
use std::time::Duration;

use mijia_core::mock::{MockPublisher, MockSensor, MockTransport, MockWarningSink};
use mijia_core::publish::Measurement;
use mijia_core::session::{PeripheralSession, SessionConfig, SessionState};
use mijia_core::{DeviceFilter, Error};
use mijia_types::{SensorAddress, SensorKind, uuids};

const ADDRESS: &str = "a4:c1:38:0d:ee:ff";

struct Harness {
    transport: Arc<MockTransport>,
    publisher: Arc<MockPublisher>,
    warnings: Arc<MockWarningSink>,
    sensor: Arc<MockSensor>,
}

impl Harness {
    fn new(kind: SensorKind) -> Self {
        let transport = Arc::new(MockTransport::new());
        let sensor = MockSensor::new(ADDRESS);
        if let (Some(service), Some(characteristic)) =
            (kind.data_service(), kind.data_characteristic())
        {
            sensor.add_characteristic(service, characteristic);
        }
        transport.add_sensor(Arc::clone(&sensor));
        Self {
            transport,
            publisher: Arc::new(MockPublisher::default()),
            warnings: Arc::new(MockWarningSink::default()),
            sensor,
        }
    }

    fn session(&self, config: SessionConfig) -> Arc<PeripheralSession> {
        PeripheralSession::new(
            SensorAddress::new(ADDRESS),
            config,
            Arc::clone(&self.transport) as _,
            Arc::clone(&self.publisher) as _,
            Arc::clone(&self.warnings) as _,
        )
    }

    /// Handle to the data characteristic. Replaces the registration made
    /// in `new`, so call before `start`.
    fn data_characteristic(&self, kind: SensorKind) -> Arc<mijia_core::mock::MockCharacteristic> {
        self.sensor.add_characteristic(
            kind.data_service().unwrap(),
            kind.data_characteristic().unwrap(),
        )
    }
}

async fn settle() {
    // Let spawned notification/teardown tasks run.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn binary_notification_publishes_temperature_and_humidity() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let data = harness.data_characteristic(SensorKind::Lywsd03);
    let session = harness.session(SessionConfig::new(SensorKind::Lywsd03).read_firmware(false));

    session.start().await.unwrap();
    // int16 LE 2350 at offset 0, humidity byte 55 at offset 2
    data.notify(vec![0x2E, 0x09, 55]);
    settle().await;

    let temperatures = harness.publisher.published_for("measure_temperature");
    assert_eq!(temperatures, vec![Measurement::MeasureTemperature(23.5)]);
    let humidity = harness.publisher.published_for("measure_humidity");
    assert_eq!(humidity, vec![Measurement::MeasureHumidity(55.0)]);

    // Default policy releases the connection after the first reading
    settle().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.sensor.disconnect_calls(), 1);
}

#[tokio::test]
async fn temperature_offset_is_applied_after_scaling() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let data = harness.data_characteristic(SensorKind::Lywsd03);
    let session = harness.session(
        SessionConfig::new(SensorKind::Lywsd03)
            .read_firmware(false)
            .temperature_offset(1.5),
    );

    session.start().await.unwrap();
    data.notify(vec![0x2E, 0x09, 55]);
    settle().await;

    assert_eq!(
        harness.publisher.published_for("measure_temperature"),
        vec![Measurement::MeasureTemperature(25.0)]
    );
}

#[tokio::test]
async fn short_payload_publishes_nothing_and_warns() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let data = harness.data_characteristic(SensorKind::Lywsd03);
    let session = harness.session(SessionConfig::new(SensorKind::Lywsd03).read_firmware(false));

    session.start().await.unwrap();
    data.notify(vec![0x2E, 0x09]);
    settle().await;

    assert!(harness.publisher.published_for("measure_temperature").is_empty());
    assert!(harness.publisher.published_for("measure_humidity").is_empty());
    let warning = harness
        .warnings
        .current(&SensorAddress::new(ADDRESS))
        .unwrap();
    assert!(warning.contains("expected 3 bytes"));

    // A decode failure is not fatal: the subscription stays up
    assert_eq!(session.state(), SessionState::Receiving);
    session.stop().await;
}

#[tokio::test]
async fn out_of_range_temperature_is_omitted_from_publication() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let data = harness.data_characteristic(SensorKind::Lywsd03);
    let session = harness.session(
        SessionConfig::new(SensorKind::Lywsd03)
            .read_firmware(false)
            .stay_subscribed(),
    );

    session.start().await.unwrap();
    // 81.00°C: decodes fine, fails the [-20, 50] plausibility check
    data.notify(vec![0xA4, 0x1F, 55]);
    settle().await;

    assert!(harness.publisher.published_for("measure_temperature").is_empty());
    // The humidity from the same notification still goes out
    assert_eq!(
        harness.publisher.published_for("measure_humidity"),
        vec![Measurement::MeasureHumidity(55.0)]
    );

    session.stop().await;
}

#[tokio::test]
async fn duplicate_notifications_publish_once() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let data = harness.data_characteristic(SensorKind::Lywsd03);
    let session = harness.session(
        SessionConfig::new(SensorKind::Lywsd03)
            .read_firmware(false)
            .stay_subscribed(),
    );

    session.start().await.unwrap();
    data.notify(vec![0x2E, 0x09, 55]);
    settle().await;
    data.notify(vec![0x2E, 0x09, 55]);
    settle().await;

    assert_eq!(
        harness.publisher.published_for("measure_temperature").len(),
        1
    );

    // A changed payload is accepted again
    data.notify(vec![0x2F, 0x09, 56]);
    settle().await;
    assert_eq!(
        harness.publisher.published_for("measure_temperature").len(),
        2
    );

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_open_one_connection() {
    let harness = Harness::new(SensorKind::Lywsd03);
    harness.sensor.set_connect_latency(Duration::from_millis(100));
    let session = harness.session(SessionConfig::new(SensorKind::Lywsd03).read_firmware(false));

    let first = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.start().await }
    });
    let second = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.start().await }
    });

    let results = [first.await.unwrap(), second.await.unwrap()];
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(Error::SessionBusy { .. })))
        .count();
    let ok = results.iter().filter(|r| r.is_ok()).count();

    assert_eq!(ok, 1);
    assert_eq!(busy, 1);
    assert_eq!(harness.sensor.connect_calls(), 1);

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn watchdog_tears_down_silent_session() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let session = harness.session(SessionConfig::new(SensorKind::Lywsd03).read_firmware(false));

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Subscribed);

    // No notification ever arrives; the 10s watchdog must fire
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.sensor.disconnect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn accepted_notifications_keep_watchdog_at_bay() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let data = harness.data_characteristic(SensorKind::Lywsd03);
    let session = harness.session(
        SessionConfig::new(SensorKind::Lywsd03)
            .read_firmware(false)
            .stay_subscribed(),
    );

    session.start().await.unwrap();

    // Distinct payloads every 6s: each re-arms the 10s watchdog
    for humidity in 50..54u8 {
        tokio::time::sleep(Duration::from_secs(6)).await;
        data.notify(vec![0x2E, 0x09, humidity]);
        settle().await;
        assert_eq!(session.state(), SessionState::Receiving);
    }

    // Silence now lets it fire
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.sensor.disconnect_calls(), 1);
}

#[tokio::test]
async fn battery_characteristic_byte_is_published_as_percent() {
    let harness = Harness::new(SensorKind::Lywsd02);
    let (battery_service, battery_characteristic) =
        SensorKind::Lywsd02.battery_characteristic().unwrap();
    let battery = harness
        .sensor
        .add_characteristic(battery_service, battery_characteristic);
    battery.set_value(vec![0x5A]);

    let session = harness.session(SessionConfig::new(SensorKind::Lywsd02).read_firmware(false));
    session.start().await.unwrap();

    assert_eq!(
        harness.publisher.published_for("measure_battery"),
        vec![Measurement::MeasureBattery(90)]
    );

    session.stop().await;
}

#[tokio::test]
async fn notify_enable_written_once_and_skipped_when_set() {
    let harness = Harness::new(SensorKind::Lywsd02);
    let data = harness.data_characteristic(SensorKind::Lywsd02);
    let session = harness.session(SessionConfig::new(SensorKind::Lywsd02).read_firmware(false));

    // First cycle: characteristic reads empty, so the enable is written
    session.start().await.unwrap();
    assert_eq!(data.writes(), vec![vec![0x01, 0x00]]);
    session.stop().await;

    // Second cycle: already enabled, no further write
    data.set_value(vec![0x01, 0x00]);
    session.start().await.unwrap();
    assert_eq!(data.writes().len(), 1);
    session.stop().await;
}

#[tokio::test]
async fn voltage_bearing_payload_publishes_battery_and_voltage() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let data = harness.data_characteristic(SensorKind::Lywsd03);
    let session = harness.session(SessionConfig::new(SensorKind::Lywsd03).read_firmware(false));

    session.start().await.unwrap();
    // temp 23.50°C, humidity 55%, 2980 mV
    data.notify(vec![0x2E, 0x09, 55, 0xA4, 0x0B]);
    settle().await;

    assert_eq!(
        harness.publisher.published_for("measure_battery"),
        vec![Measurement::MeasureBattery(98)]
    );
    assert_eq!(
        harness.publisher.published_for("measure_voltage"),
        vec![Measurement::MeasureVoltage(2.98)]
    );
    // measure_voltage was registered before first publication
    assert!(
        harness
            .publisher
            .capabilities()
            .contains(&(SensorAddress::new(ADDRESS), "measure_voltage"))
    );
}

#[tokio::test]
async fn rssi_is_published_with_each_cycle() {
    let harness = Harness::new(SensorKind::Lywsd03);
    harness.sensor.set_rssi(-70);
    let session = harness.session(SessionConfig::new(SensorKind::Lywsd03).read_firmware(false));

    session.start().await.unwrap();

    assert_eq!(
        harness.publisher.published_for("measure_rssi"),
        vec![Measurement::MeasureRssi(-70)]
    );
    // -70 dBm is fine; no weak-signal warning
    assert!(
        harness
            .warnings
            .current(&SensorAddress::new(ADDRESS))
            .is_none()
    );

    session.stop().await;
}

#[tokio::test]
async fn ascii_sensor_end_to_end() {
    let harness = Harness::new(SensorKind::Lywsdcgq);
    let data = harness.data_characteristic(SensorKind::Lywsdcgq);
    // LYWSDCGQ wants the legacy notify-enable write and standard battery
    let (enable_service, enable_characteristic) = SensorKind::Lywsdcgq.notify_enable().unwrap();
    harness
        .sensor
        .add_characteristic(enable_service, enable_characteristic);
    let (battery_service, battery_characteristic) =
        SensorKind::Lywsdcgq.battery_characteristic().unwrap();
    let battery = harness
        .sensor
        .add_characteristic(battery_service, battery_characteristic);
    battery.set_value(vec![87]);

    let session = harness.session(SessionConfig::new(SensorKind::Lywsdcgq).read_firmware(false));
    session.start().await.unwrap();
    data.notify(b"T=23.4 H=45.6".to_vec());
    settle().await;

    let temperatures = harness.publisher.published_for("measure_temperature");
    assert_eq!(temperatures.len(), 1);
    match temperatures[0] {
        Measurement::MeasureTemperature(t) => assert!((t - 23.4).abs() < 0.001),
        other => panic!("unexpected measurement {other:?}"),
    }
    assert_eq!(
        harness.publisher.published_for("measure_battery"),
        vec![Measurement::MeasureBattery(87)]
    );
}

#[tokio::test]
async fn pairing_filter_classifies_advertisements() {
    // The 181a long form matches, unrelated records do not
    let matching = {
        let mut record =
            mijia_core::AdvertisementRecord::new(SensorAddress::new("a4c1380deeff"));
        record.service_uuids = vec!["0000181a-0000-1000-8000-00805f9b34fb".to_string()];
        record
    };
    let unrelated = {
        let mut record =
            mijia_core::AdvertisementRecord::new(SensorAddress::new("001122334455"));
        record.service_uuids = vec!["0000feaa-0000-1000-8000-00805f9b34fb".to_string()];
        record.local_name = Some("Flower care".to_string());
        record
    };

    let filter = DeviceFilter::new().accept_service(uuids::ADVERTISEMENT_SERVICE);
    assert!(filter.matches(&matching));
    assert!(!filter.matches(&unrelated));
}

#[tokio::test]
async fn firmware_read_is_logged_not_published() {
    let harness = Harness::new(SensorKind::Lywsd03);
    let firmware = harness
        .sensor
        .add_characteristic(uuids::DEVICE_INFO_SERVICE, uuids::FIRMWARE_REVISION);
    firmware.set_value(b"1.1.2_0016".to_vec());

    let session = harness.session(SessionConfig::new(SensorKind::Lywsd03));
    session.start().await.unwrap();

    // Firmware revision never becomes a measurement
    assert!(harness.publisher.published().is_empty());

    session.stop().await;
}
