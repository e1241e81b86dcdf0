//! Advertisement classification and shared discovery.
//!
//! Two concerns live here:
//!
//! - [`DeviceFilter`]: pure classification of advertisement records into
//!   "is this one of ours", by service UUID set (short or long form),
//!   local-name substring, or service-data presence. Used at pairing time.
//! - [`SharedDiscovery`]: a caching front for the transport's timed scan.
//!   Concurrent callers are coalesced onto a single in-flight scan, each
//!   caller waits at most its own timeout, and a recent result is served
//!   from cache without scanning at all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mijia_types::{ParseResult, Reading, SensorKind, uuids};

use crate::decode;
use crate::error::{Error, Result};
use crate::transport::{AdvertisementRecord, Transport};

/// Default lifetime of a cached discovery result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default per-caller wait before falling back to the cache.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(9_500);

/// Default scan duration for a fresh discovery.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(30);

/// Classifies advertisement records for one driver.
///
/// A record matches when ANY enabled criterion matches: an advertised
/// service UUID (or service-data key) in the accepted set, a local-name
/// fragment, or the mere presence of service data.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    service_uuids: Vec<Uuid>,
    name_fragments: Vec<String>,
    match_any_service_data: bool,
}

impl DeviceFilter {
    /// Create an empty filter that matches nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The filter used at pairing time for a sensor kind.
    #[must_use]
    pub fn for_kind(kind: SensorKind) -> Self {
        match kind {
            // Stock LYWSD02 advertises the environmental-sensing service
            SensorKind::Lywsd02 => Self::new().accept_service(uuids::ADVERTISEMENT_SERVICE),
            // Stock LYWSD03 advertisements are unhelpful; match by name
            SensorKind::Lywsd03 => Self::new().accept_name_fragment("LYWSD03"),
            // LYWSDCGQ advertises the standard battery service
            SensorKind::Lywsdcgq => Self::new().accept_service(uuids::BATTERY_SERVICE),
            // ATC firmware carries readings as 181a service data
            SensorKind::AtcMijia => Self::new()
                .accept_service(uuids::ADVERTISEMENT_SERVICE)
                .require_service_data(),
            // `SensorKind` is `#[non_exhaustive]`; all known kinds are handled above.
            _ => unreachable!("unhandled SensorKind variant"),
        }
    }

    /// Accept records advertising this service UUID.
    #[must_use]
    pub fn accept_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    /// Accept records whose local name contains this fragment
    /// (case-insensitive).
    #[must_use]
    pub fn accept_name_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.name_fragments.push(fragment.into().to_uppercase());
        self
    }

    /// Accept records carrying any service-data entry at all.
    #[must_use]
    pub fn require_service_data(mut self) -> Self {
        self.match_any_service_data = true;
        self
    }

    /// Classify a single record.
    #[must_use]
    pub fn matches(&self, record: &AdvertisementRecord) -> bool {
        for accepted in &self.service_uuids {
            let advertised = record
                .service_uuids
                .iter()
                .chain(record.service_data.iter().map(|(uuid, _)| uuid));
            for candidate in advertised {
                if uuids::matches(*accepted, candidate) {
                    return true;
                }
            }
        }

        if let Some(name) = &record.local_name {
            let name = name.to_uppercase();
            if self
                .name_fragments
                .iter()
                .any(|fragment| name.contains(fragment))
            {
                return true;
            }
        }

        if self.match_any_service_data && !record.service_data.is_empty() {
            return true;
        }

        false
    }

    /// Keep only the matching records.
    #[must_use]
    pub fn filter(&self, records: &[AdvertisementRecord]) -> Vec<AdvertisementRecord> {
        records
            .iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect()
    }
}

/// Extract an ATC reading from a record's `181a` service data, if present.
///
/// Broadcast-only firmware never gets a session; its readings ride along
/// in every advertisement instead. The result is already range-validated:
/// implausible fields are dropped, same as on the session path.
pub fn atc_reading_from_record(
    record: &AdvertisementRecord,
    temperature_offset: f32,
) -> Option<ParseResult<Reading>> {
    record
        .service_data
        .iter()
        .find(|(uuid, _)| uuids::matches(uuids::ADVERTISEMENT_SERVICE, uuid))
        .map(|(_, data)| {
            decode::decode_atc_advertisement(data, temperature_offset).map(|reading| {
                let mut reading = decode::validate(reading, &SensorKind::AtcMijia.ranges());
                reading.rssi = record.rssi;
                reading
            })
        })
}

/// Options for [`SharedDiscovery`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Scan duration for a fresh discovery.
    pub scan_duration: Duration,
    /// How long a completed result is served from cache.
    pub cache_ttl: Duration,
    /// How long a caller waits for an in-flight scan before falling back.
    pub wait_timeout: Duration,
    /// Service filter passed to the transport scan; empty scans everything.
    pub filter_uuids: Vec<Uuid>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            scan_duration: DEFAULT_SCAN_DURATION,
            cache_ttl: DEFAULT_CACHE_TTL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            filter_uuids: Vec::new(),
        }
    }
}

struct CachedScan {
    records: Arc<Vec<AdvertisementRecord>>,
    at: Instant,
}

type ScanResult = Option<Arc<Vec<AdvertisementRecord>>>;

struct DiscoveryState {
    cache: Option<CachedScan>,
    in_flight: Option<watch::Receiver<ScanResult>>,
}

/// Coalescing, caching front for BLE discovery.
///
/// All concurrent [`discover`](Self::discover) calls share one underlying
/// scan. The scan itself runs detached, so it completes and fills the
/// cache even when every caller has already timed out and settled for the
/// cached result.
pub struct SharedDiscovery {
    transport: Arc<dyn Transport>,
    options: DiscoveryOptions,
    state: Arc<Mutex<DiscoveryState>>,
}

impl SharedDiscovery {
    /// Create a shared discovery with default options.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, DiscoveryOptions::default())
    }

    /// Create a shared discovery with custom options.
    pub fn with_options(transport: Arc<dyn Transport>, options: DiscoveryOptions) -> Self {
        Self {
            transport,
            options,
            state: Arc::new(Mutex::new(DiscoveryState {
                cache: None,
                in_flight: None,
            })),
        }
    }

    /// Get advertisement records, from cache or a (shared) fresh scan.
    ///
    /// - A cache entry younger than the TTL is returned immediately.
    /// - Otherwise the caller joins the in-flight scan (starting one if
    ///   none is running) and waits up to `wait_timeout`.
    /// - On timeout, a stale cache entry is better than nothing; with no
    ///   cache at all the caller gets a timeout error while the scan runs
    ///   on for the next caller's benefit.
    pub async fn discover(&self) -> Result<Vec<AdvertisementRecord>> {
        let mut rx = {
            let mut state = self.state.lock().await;

            if let Some(cached) = &state.cache
                && cached.at.elapsed() < self.options.cache_ttl
            {
                debug!("discovery served from cache");
                return Ok(cached.records.as_ref().clone());
            }

            match &state.in_flight {
                Some(rx) => rx.clone(),
                None => {
                    let rx = self.spawn_scan();
                    state.in_flight = Some(rx.clone());
                    rx
                }
            }
        };

        let wait = self.options.wait_timeout;
        let fresh = tokio::time::timeout(wait, async {
            loop {
                if let Some(records) = rx.borrow_and_update().clone() {
                    return records;
                }
                if rx.changed().await.is_err() {
                    // Scan task died; treat like an empty result
                    return Arc::new(Vec::new());
                }
            }
        })
        .await;

        match fresh {
            Ok(records) => Ok(records.as_ref().clone()),
            Err(_) => {
                let state = self.state.lock().await;
                if let Some(cached) = &state.cache {
                    info!("fresh discovery too slow, serving last known result");
                    return Ok(cached.records.as_ref().clone());
                }
                Err(Error::timeout("discover", wait))
            }
        }
    }

    /// Spawn the detached scan task and return its result channel.
    fn spawn_scan(&self) -> watch::Receiver<ScanResult> {
        let (tx, rx) = watch::channel(None);
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let filter = self.options.filter_uuids.clone();
        let duration = self.options.scan_duration;

        tokio::spawn(async move {
            let records = match transport.discover(&filter, duration).await {
                Ok(records) => {
                    debug!(count = records.len(), "discovery scan complete");
                    Arc::new(records)
                }
                Err(error) => {
                    warn!(%error, "discovery scan failed");
                    Arc::new(Vec::new())
                }
            };

            {
                let mut state = state.lock().await;
                state.cache = Some(CachedScan {
                    records: Arc::clone(&records),
                    at: Instant::now(),
                });
                state.in_flight = None;
            }
            let _ = tx.send(Some(records));
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use mijia_types::SensorAddress;

    fn record(address: &str) -> AdvertisementRecord {
        AdvertisementRecord::new(SensorAddress::new(address))
    }

    // --- DeviceFilter tests ---

    #[test]
    fn test_filter_matches_long_form_service_uuid() {
        let filter = DeviceFilter::new().accept_service(uuids::ADVERTISEMENT_SERVICE);
        let mut ad = record("a4c1380deeff");
        ad.service_uuids = vec!["0000181a-0000-1000-8000-00805f9b34fb".to_string()];
        assert!(filter.matches(&ad));
    }

    #[test]
    fn test_filter_matches_short_form_service_uuid() {
        let filter = DeviceFilter::new().accept_service(uuids::ADVERTISEMENT_SERVICE);
        let mut ad = record("a4c1380deeff");
        ad.service_uuids = vec!["181a".to_string()];
        assert!(filter.matches(&ad));
    }

    #[test]
    fn test_filter_rejects_unrelated_record() {
        let filter = DeviceFilter::new()
            .accept_service(uuids::ADVERTISEMENT_SERVICE)
            .accept_name_fragment("LYWSD03");
        let mut ad = record("001122334455");
        ad.service_uuids = vec!["0000feaa-0000-1000-8000-00805f9b34fb".to_string()];
        ad.local_name = Some("Flower care".to_string());
        assert!(!filter.matches(&ad));
    }

    #[test]
    fn test_filter_matches_name_fragment_case_insensitive() {
        let filter = DeviceFilter::new().accept_name_fragment("LYWSD03");
        let mut ad = record("a4c1380deeff");
        ad.local_name = Some("lywsd03mmc".to_string());
        assert!(filter.matches(&ad));
    }

    #[test]
    fn test_filter_matches_service_data_key() {
        let filter = DeviceFilter::new().accept_service(uuids::ADVERTISEMENT_SERVICE);
        let mut ad = record("a4c1380deeff");
        ad.service_data = vec![("181a".to_string(), vec![0u8; 13])];
        assert!(filter.matches(&ad));
    }

    #[test]
    fn test_filter_service_data_presence() {
        let filter = DeviceFilter::new().require_service_data();
        let mut ad = record("a4c1380deeff");
        assert!(!filter.matches(&ad));
        ad.service_data = vec![("fe95".to_string(), vec![1, 2, 3])];
        assert!(filter.matches(&ad));
    }

    #[test]
    fn test_filter_batch() {
        let filter = DeviceFilter::for_kind(SensorKind::Lywsd02);
        let mut matching = record("a4c1380deeff");
        matching.service_uuids = vec!["0000181a-0000-1000-8000-00805f9b34fb".to_string()];
        let other = record("001122334455");

        let kept = filter.filter(&[matching.clone(), other]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].address, matching.address);
    }

    // --- ATC service-data extraction ---

    #[test]
    fn test_atc_reading_from_record() {
        let mut ad = record("a4c1380deeff");
        ad.rssi = Some(-68);
        ad.service_data = vec![(
            "181a".to_string(),
            vec![0xA4, 0xC1, 0x38, 0x0D, 0xEE, 0xFF, 0x00, 0xD7, 48, 93],
        )];

        let reading = atc_reading_from_record(&ad, 0.0).unwrap().unwrap();
        assert!((reading.temperature.unwrap() - 21.5).abs() < 0.001);
        assert_eq!(reading.battery, Some(93));
        assert_eq!(reading.rssi, Some(-68));
    }

    #[test]
    fn test_atc_reading_absent_without_service_data() {
        let ad = record("a4c1380deeff");
        assert!(atc_reading_from_record(&ad, 0.0).is_none());
    }

    // --- SharedDiscovery tests ---

    fn discovery_options() -> DiscoveryOptions {
        DiscoveryOptions {
            scan_duration: Duration::from_secs(20),
            cache_ttl: Duration::from_secs(30),
            wait_timeout: Duration::from_millis(9_500),
            filter_uuids: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_scan() {
        let transport = Arc::new(MockTransport::new());
        transport.set_discovery_records(vec![record("a4c1380deeff")]);
        transport.set_discover_latency(Duration::from_secs(2));

        let discovery = Arc::new(SharedDiscovery::with_options(
            Arc::clone(&transport) as _,
            discovery_options(),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let discovery = Arc::clone(&discovery);
            handles.push(tokio::spawn(async move { discovery.discover().await }));
        }
        for handle in handles {
            let records = handle.await.unwrap().unwrap();
            assert_eq!(records.len(), 1);
        }

        assert_eq!(transport.discover_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_skips_scan() {
        let transport = Arc::new(MockTransport::new());
        transport.set_discovery_records(vec![record("a4c1380deeff")]);

        let discovery =
            SharedDiscovery::with_options(Arc::clone(&transport) as _, discovery_options());

        discovery.discover().await.unwrap();
        assert_eq!(transport.discover_calls(), 1);

        // Within the TTL the cache answers without a second scan
        tokio::time::sleep(Duration::from_secs(10)).await;
        discovery.discover().await.unwrap();
        assert_eq!(transport.discover_calls(), 1);

        // After the TTL a fresh scan runs
        tokio::time::sleep(Duration::from_secs(31)).await;
        discovery.discover().await.unwrap();
        assert_eq!(transport.discover_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_scan_falls_back_to_cache() {
        let transport = Arc::new(MockTransport::new());
        transport.set_discovery_records(vec![record("a4c1380deeff")]);

        let discovery =
            SharedDiscovery::with_options(Arc::clone(&transport) as _, discovery_options());

        // Prime the cache with a fast scan
        discovery.discover().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        // Second scan is slower than the caller's patience
        transport.set_discover_latency(Duration::from_secs(20));
        let records = discovery.discover().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(transport.discover_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_scan_without_cache_times_out() {
        let transport = Arc::new(MockTransport::new());
        transport.set_discover_latency(Duration::from_secs(20));

        let discovery =
            SharedDiscovery::with_options(Arc::clone(&transport) as _, discovery_options());

        let err = discovery.discover().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        // The scan kept running and filled the cache for the next caller
        tokio::time::sleep(Duration::from_secs(15)).await;
        let records = discovery.discover().await.unwrap();
        assert!(records.is_empty());
        assert_eq!(transport.discover_calls(), 1);
    }
}
