use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use mijia_core::btle::BtleTransport;
use mijia_core::discovery::{
    DeviceFilter, DiscoveryOptions, SharedDiscovery, atc_reading_from_record,
};
use mijia_core::poll::PollScheduler;
use mijia_core::publish::{ChannelPublisher, LogWarningSink};
use mijia_core::session::{PeripheralSession, SessionConfig};
use mijia_core::settings::SensorSettings;
use mijia_types::{SensorAddress, SensorKind};

#[derive(Parser)]
#[command(name = "mijia")]
#[command(author, version, about = "CLI for Xiaomi Mijia BLE thermometers", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby Mijia sensors
    Scan {
        /// Only list sensors of this kind
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,

        /// Scan duration in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },

    /// Poll a sensor and print its readings
    Watch {
        /// Device address (MAC address or UUID)
        device: String,

        /// Sensor kind
        #[arg(short, long, value_enum, default_value = "lywsd03")]
        kind: KindArg,

        /// Poll interval in seconds
        #[arg(short, long, default_value = "300")]
        interval: u64,

        /// Temperature offset in °C (may be negative)
        #[arg(short, long, default_value = "0.0", allow_hyphen_values = true)]
        offset: f32,
    },
}

/// Sensor kind as a CLI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Lywsd02,
    Lywsd03,
    Lywsdcgq,
    Atc,
}

impl From<KindArg> for SensorKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Lywsd02 => SensorKind::Lywsd02,
            KindArg::Lywsd03 => SensorKind::Lywsd03,
            KindArg::Lywsdcgq => SensorKind::Lywsdcgq,
            KindArg::Atc => SensorKind::AtcMijia,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Scan { kind, duration } => scan(kind, duration, cli.json).await,
        Commands::Watch {
            device,
            kind,
            interval,
            offset,
        } => watch(&device, kind.into(), interval, offset, cli.json).await,
    }
}

async fn scan(kind: Option<KindArg>, duration: u64, json: bool) -> Result<()> {
    let transport = Arc::new(
        BtleTransport::new()
            .await
            .context("no Bluetooth adapter available")?,
    );
    let discovery = SharedDiscovery::with_options(
        transport,
        DiscoveryOptions {
            scan_duration: Duration::from_secs(duration),
            // A fresh-run scan should wait for its own result
            wait_timeout: Duration::from_secs(duration + 5),
            ..Default::default()
        },
    );

    let records = discovery.discover().await?;
    let records = match kind {
        Some(kind) => DeviceFilter::for_kind(kind.into()).filter(&records),
        None => records,
    };

    if records.is_empty() {
        tracing::info!("no matching sensors found");
        return Ok(());
    }

    for record in &records {
        let detected = record
            .local_name
            .as_deref()
            .and_then(SensorKind::from_name);
        let reading = atc_reading_from_record(record, 0.0).and_then(|r| r.ok());

        if json {
            println!(
                "{}",
                serde_json::json!({
                    "address": record.address.as_str(),
                    "name": record.local_name,
                    "kind": detected.map(|k| k.to_string()),
                    "rssi": record.rssi,
                    "reading": reading.map(|r| r.to_string()),
                })
            );
        } else {
            let name = record.local_name.as_deref().unwrap_or("(unnamed)");
            let rssi = record
                .rssi
                .map(|r| format!("{r} dBm"))
                .unwrap_or_else(|| "-".to_string());
            match reading {
                Some(reading) => println!("{}  {name}  {rssi}  {reading}", record.address),
                None => println!("{}  {name}  {rssi}", record.address),
            }
        }
    }
    Ok(())
}

async fn watch(
    device: &str,
    kind: SensorKind,
    interval: u64,
    offset: f32,
    json: bool,
) -> Result<()> {
    let address: SensorAddress = device.parse().context("invalid device address")?;
    let settings = SensorSettings::new()
        .temperature_offset(offset)
        .poll_interval(Duration::from_secs(interval));
    settings.validate()?;

    if kind == SensorKind::AtcMijia {
        return watch_broadcast(address, offset, interval, json).await;
    }

    let transport = Arc::new(
        BtleTransport::new()
            .await
            .context("no Bluetooth adapter available")?,
    );
    let publisher = Arc::new(ChannelPublisher::default());
    let mut readings = publisher.subscribe();

    let session = PeripheralSession::new(
        address,
        SessionConfig::with_settings(kind, &settings),
        transport,
        Arc::clone(&publisher) as _,
        Arc::new(LogWarningSink),
    );
    let scheduler = PollScheduler::new(Arc::clone(&session));
    scheduler.start(settings.poll_interval)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            published = readings.recv() => {
                let Ok(published) = published else { continue };
                if json {
                    println!("{}", serde_json::to_string(&published)?);
                } else {
                    println!(
                        "{}  {} = {:?}",
                        published.address,
                        published.measurement.capability(),
                        published.measurement
                    );
                }
            }
        }
    }

    scheduler.shutdown();
    session.stop().await;
    Ok(())
}

/// ATC firmware never gets a connection; poll its advertisements instead.
async fn watch_broadcast(
    address: SensorAddress,
    offset: f32,
    interval: u64,
    json: bool,
) -> Result<()> {
    let transport = Arc::new(
        BtleTransport::new()
            .await
            .context("no Bluetooth adapter available")?,
    );
    let scan_duration = Duration::from_secs(20).min(Duration::from_secs(interval.max(1)));
    let discovery = SharedDiscovery::with_options(
        transport,
        DiscoveryOptions {
            scan_duration,
            // Each tick should wait for its own scan to finish
            wait_timeout: scan_duration + Duration::from_secs(5),
            ..Default::default()
        },
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let records = match discovery.discover().await {
                    Ok(records) => records,
                    Err(error) => {
                        tracing::warn!(%error, "discovery failed, will retry");
                        continue;
                    }
                };
                for record in records.iter().filter(|r| r.address == address) {
                    match atc_reading_from_record(record, offset) {
                        Some(Ok(reading)) => {
                            if json {
                                println!("{}", serde_json::to_string(&reading)?);
                            } else {
                                println!("{}  {reading}", record.address);
                            }
                        }
                        Some(Err(error)) => {
                            tracing::warn!(%error, "undecodable advertisement payload");
                        }
                        None => {}
                    }
                }
            }
        }
    }
    Ok(())
}
