//! prf-tool: host tool for the PRF DAB radio front-end.
//!
//! Reads device status, streams telemetry, watches the public warning system
//! and updates firmware over SPI (or a simulated board).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use prf_protocol::sim::SimulatedDevice;
use prf_protocol::{
    Channel, CounterTracker, DabConfig, Link, Mask, PrfClient, ProtocolVersion, PwsConfig,
    PwsStatus, Storage, TransportKind, Version,
};
use serde::Serialize;

mod config;
mod flash;
mod logging;
mod monitor;
#[cfg(unix)]
mod spidev;

use config::{ConfigFile, EventEntry};
use flash::FlashOptions;
use monitor::PwsMonitor;

type DynChannel = Box<dyn Channel + Send>;

/// prf-tool - PRF DAB front-end host tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// SPI device node
    #[arg(short, long)]
    device: Option<String>,

    /// Transport the device is attached through
    #[arg(short, long, value_enum)]
    transport: Option<TransportArg>,

    /// SPI clock in Hz
    #[arg(long)]
    speed_hz: Option<u32>,

    /// Protocol revision the host speaks (1 or 2)
    #[arg(long)]
    protocol: Option<u8>,

    /// Talk to an in-memory simulated board instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print version, serial number, configuration and warning status
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Poll the PWS status and run actions when a warning rises
    Monitor {
        /// Poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Extra registration as EVENT:ZONE (repeatable)
        #[arg(long = "event", value_parser = parse_event)]
        events: Vec<(u8, u32)>,
    },
    /// Read composite telemetry buffers
    Telemetry {
        /// Mask bits, e.g. 0x41 for signal info + tick
        #[arg(long, value_parser = parse_mask, default_value = "0x41")]
        mask: Mask,

        /// Number of buffers to read
        #[arg(short = 'n', long, default_value = "10")]
        count: u32,

        /// Delay between reads in milliseconds
        #[arg(long, default_value = "100")]
        interval_ms: u64,
    },
    /// Firmware update
    Dfu {
        #[command(subcommand)]
        action: DfuCmd,
    },
}

#[derive(Subcommand, Debug)]
enum DfuCmd {
    /// Write an image to the device
    Flash { image: PathBuf },
    /// Read the device image back
    Dump {
        output: PathBuf,
        /// Bytes to read
        #[arg(long)]
        size: usize,
    },
    /// Restore the factory image
    Revert,
    /// Release a device left in DFU by an interrupted transfer
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Spi,
    UsbControl,
    UsbStream,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Spi => TransportKind::Spi,
            TransportArg::UsbControl => TransportKind::UsbControl,
            TransportArg::UsbStream => TransportKind::UsbStream,
        }
    }
}

fn parse_event(text: &str) -> Result<(u8, u32), String> {
    let (event, zone) = text
        .split_once(':')
        .ok_or_else(|| format!("expected EVENT:ZONE, got '{}'", text))?;
    let event = event
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("invalid event id '{}': {}", event, e))?;
    let zone = zone
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid zone id '{}': {}", zone, e))?;
    Ok((event, zone))
}

fn parse_mask(text: &str) -> Result<Mask, String> {
    let text = text.trim();
    let bits = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse::<u8>(),
    }
    .map_err(|e| format!("invalid mask '{}': {}", text, e))?;
    Ok(Mask::from_bits(bits))
}

/// Device settings after merging CLI flags over the config file.
#[derive(Debug, Clone, PartialEq)]
struct DeviceSettings {
    path: String,
    transport: TransportKind,
    speed_hz: u32,
    spi_mode: u8,
    bits_per_word: u8,
    version: ProtocolVersion,
}

impl DeviceSettings {
    fn resolve(args: &Args, file: &ConfigFile) -> Result<Self, String> {
        let device = &file.device;
        let protocol = args
            .protocol
            .or(device.protocol)
            .unwrap_or(ProtocolVersion::CURRENT.as_u8());
        let version = ProtocolVersion::try_from(protocol)
            .map_err(|v| format!("unsupported protocol version {}", v))?;
        Ok(Self {
            path: args
                .device
                .clone()
                .or_else(|| device.path.clone())
                .unwrap_or_else(|| config::DEFAULT_DEVICE.to_string()),
            transport: args
                .transport
                .map(TransportKind::from)
                .or(device.transport)
                .unwrap_or(TransportKind::Spi),
            speed_hz: args
                .speed_hz
                .or(device.speed_hz)
                .unwrap_or(config::DEFAULT_SPEED_HZ),
            spi_mode: device.spi_mode.unwrap_or(config::DEFAULT_SPI_MODE),
            bits_per_word: device
                .bits_per_word
                .unwrap_or(config::DEFAULT_BITS_PER_WORD),
            version,
        })
    }
}

fn open_channel(settings: &DeviceSettings, simulate: bool) -> Result<DynChannel, Box<dyn std::error::Error>> {
    if simulate {
        let device = SimulatedDevice::new(settings.transport, settings.version);
        let handle = device.handle();
        handle.set_pws_toggle_every(20);
        handle.set_upload_image((0..4096u32).map(|i| (i % 251) as u8).collect());
        info!("Using simulated PRF on {}", settings.transport);
        return Ok(Box::new(device));
    }

    match settings.transport {
        #[cfg(unix)]
        TransportKind::Spi => {
            let spi = spidev::SpiDev::open(
                Path::new(&settings.path),
                spidev::SpiSettings {
                    mode: settings.spi_mode,
                    bits_per_word: settings.bits_per_word,
                    speed_hz: settings.speed_hz,
                },
            )
            .map_err(|e| format!("Failed to open {}: {}", settings.path, e))?;
            Ok(Box::new(spi))
        }
        #[cfg(not(unix))]
        TransportKind::Spi => Err("SPI access requires a Linux spidev node".into()),
        other => Err(format!("{} transport is only available with --simulate", other).into()),
    }
}

#[derive(Serialize)]
struct DeviceInfo {
    transport: TransportKind,
    protocol: ProtocolVersion,
    version: Version,
    serial: String,
    dab_config: DabConfig,
    pws_config: PwsConfig,
    pws_status: PwsStatus,
    ping: u8,
}

fn run_info(client: &PrfClient<DynChannel>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let info = DeviceInfo {
        transport: client.transport()?,
        protocol: client.version(),
        version: client.get_version()?,
        serial: client.get_serial_no()?.as_text(),
        dab_config: client.get_dab_config(Storage::Volatile)?,
        pws_config: client.get_pws_config()?,
        pws_status: client.poll_status()?,
        ping: client.ping()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }
    println!("Transport:   {}", info.transport);
    println!("Protocol:    {}", info.protocol);
    println!("Firmware:    {}", info.version);
    println!("Serial:      {}", info.serial);
    println!("DAB channel: {}", info.dab_config.channel_idx);
    println!(
        "PWS config:  zone {} events {}/{}",
        info.pws_config.zone_id, info.pws_config.event_id_1, info.pws_config.event_id_2
    );
    println!("PWS active:  {}", info.pws_status.triggered);

    if let Ok(signal) = client.get_signal_info() {
        println!(
            "Signal:      power {} dBm, ratio {}, offset {}/{}",
            signal.power_in, signal.ratio, signal.coarse_offset, signal.fine_offset
        );
    }
    Ok(())
}

/// Log a registration's label; run its shell command when one is configured.
fn event_action(entry: EventEntry) -> monitor::Action {
    let label = entry.display_label();
    Box::new(move |key| {
        warn!(
            "PWS warning: {} (event {} zone {})",
            label, key.event_id, key.zone_id
        );
        if let Some(command) = &entry.command {
            match std::process::Command::new("sh").arg("-c").arg(command).spawn() {
                Ok(_) => info!("Started action for {}: {}", label, command),
                Err(e) => error!("Failed to run action '{}': {}", command, e),
            }
        }
    })
}

fn run_monitor(
    client: PrfClient<DynChannel>,
    interval: Duration,
    entries: Vec<EventEntry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut monitor = PwsMonitor::new(client, interval);
    for entry in entries {
        let (event_id, zone_id, label) = (entry.event_id, entry.zone_id, entry.display_label());
        monitor.register_event(event_id, zone_id, label, event_action(entry))?;
    }

    let stop = monitor.stop_handle();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received, stopping monitor");
        stop.stop();
    })?;

    let stats = monitor.start()?;
    info!(
        "Polled {} times, skipped {}, fired {} actions",
        stats.polls, stats.skipped, stats.fired
    );
    Ok(())
}

fn run_telemetry(
    client: &PrfClient<DynChannel>,
    mask: Mask,
    count: u32,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    if client.transport()? == TransportKind::UsbStream {
        client.set_mask(mask)?;
    } else {
        warn!("Mask selection needs the USB stream transport; reading with the device's current mask");
    }

    let mut counters = CounterTracker::new();
    let (mut missed, mut skipped) = (0u64, 0u64);
    for _ in 0..count {
        match client.read_mask_data() {
            Ok(data) => {
                for record in &data.records {
                    match record {
                        Ok(record) => {
                            let gap = counters.observe(record.kind(), record.update_counter());
                            missed += u64::from(gap);
                            info!("{:<16} counter {:>8}", record.kind(), record.update_counter());
                        }
                        Err(e) => {
                            skipped += 1;
                            warn!("Skipping record: {}", e);
                        }
                    }
                }
            }
            Err(e) if e.is_sample_error() => {
                skipped += 1;
                warn!("Skipping buffer: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
        thread::sleep(interval);
    }

    info!("Read {} buffers: {} intervals missed, {} records skipped", count, missed, skipped);
    Ok(())
}

fn run_dfu(
    link: Arc<Link<DynChannel>>,
    action: DfuCmd,
    options: &FlashOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        DfuCmd::Flash { image } => {
            let data = std::fs::read(&image)
                .map_err(|e| format!("Failed to read {}: {}", image.display(), e))?;
            let blocks = flash::flash_image(link, &data, options)?;
            println!("Wrote {} blocks from {}", blocks, image.display());
        }
        DfuCmd::Dump { output, size } => {
            let data = flash::dump_image(link, size, options)?;
            std::fs::write(&output, &data)?;
            println!("Saved {} bytes to {}", data.len(), output.display());
        }
        DfuCmd::Revert => flash::revert_factory(link)?,
        DfuCmd::Abandon => flash::abandon(link)?,
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let file_config = match config::locate_config(args.config.as_deref()) {
        Some(path) => {
            let loaded = config::load_config(&path)?;
            eprintln!("Loaded config from: {}", path.display());
            loaded
        }
        None => ConfigFile::default(),
    };

    // Command line takes precedence
    let log_dir = args.log_dir.clone().unwrap_or_else(|| {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    });
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let settings = DeviceSettings::resolve(&args, &file_config)?;
    let channel = open_channel(&settings, args.simulate)?;
    let link = Arc::new(Link::new(channel, settings.version));

    let flash_options = FlashOptions {
        max_block_retries: file_config
            .dfu
            .max_block_retries
            .unwrap_or(config::DEFAULT_MAX_BLOCK_RETRIES),
        show_progress: true,
    };

    let result = match args.command {
        Cmd::Info { json } => {
            PrfClient::connect(Arc::clone(&link)).map_err(Into::into).and_then(|client| run_info(&client, json))
        }
        Cmd::Monitor {
            interval_ms,
            events,
        } => {
            let interval = Duration::from_millis(
                interval_ms
                    .or(file_config.monitor.poll_interval_ms)
                    .unwrap_or(config::DEFAULT_POLL_INTERVAL_MS),
            );
            let mut entries = file_config.monitor.events.clone();
            entries.extend(events.into_iter().map(|(event_id, zone_id)| EventEntry {
                event_id,
                zone_id,
                label: None,
                command: None,
            }));
            PrfClient::connect(Arc::clone(&link))
                .map_err(Into::into)
                .and_then(|client| run_monitor(client, interval, entries))
        }
        Cmd::Telemetry {
            mask,
            count,
            interval_ms,
        } => PrfClient::connect(Arc::clone(&link))
            .map_err(Into::into)
            .and_then(|client| {
                run_telemetry(&client, mask, count, Duration::from_millis(interval_ms))
            }),
        Cmd::Dfu { action } => run_dfu(Arc::clone(&link), action, &flash_options),
    };

    if let Err(e) = &result {
        error!("{}", e);
    }
    link.close();
    result
}
