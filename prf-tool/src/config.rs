//! Configuration file format.
//!
//! ```toml
//! [device]
//! path = "/dev/spidev0.0"
//! transport = "spi"
//! speed_hz = 7800000
//! spi_mode = 1
//!
//! [monitor]
//! poll_interval_ms = 100
//!
//! [[monitor.events]]
//! event_id = 1
//! zone_id = 1626704570
//! label = "flood warning"
//! command = "notify-send 'PWS' 'flood warning'"
//!
//! [logging]
//! log_dir = "logs"
//! retention_days = 7
//!
//! [dfu]
//! max_block_retries = 3
//! ```

use std::path::{Path, PathBuf};

use prf_protocol::pws::EventKey;
use prf_protocol::TransportKind;
use serde::Deserialize;
use thiserror::Error;

/// Default SPI node of the PRF board on a Raspberry Pi.
pub const DEFAULT_DEVICE: &str = "/dev/spidev0.0";
pub const DEFAULT_SPEED_HZ: u32 = 7_800_000;
pub const DEFAULT_SPI_MODE: u8 = 1;
pub const DEFAULT_BITS_PER_WORD: u8 = 8;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_BLOCK_RETRIES: u32 = 3;
pub const DEFAULT_CONFIG_FILE: &str = "prf-tool.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub dfu: DfuSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct DeviceSection {
    pub path: Option<String>,
    pub transport: Option<TransportKind>,
    pub speed_hz: Option<u32>,
    pub spi_mode: Option<u8>,
    pub bits_per_word: Option<u8>,
    /// Protocol revision the host expects (1 or 2).
    pub protocol: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
pub struct MonitorSection {
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

/// One PWS registration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EventEntry {
    pub event_id: u8,
    pub zone_id: u32,
    pub label: Option<String>,
    /// Shell command run when the warning rises.
    pub command: Option<String>,
}

impl EventEntry {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.event_id, self.zone_id)
    }

    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("event {} zone {}", self.event_id, self.zone_id))
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DfuSection {
    pub max_block_retries: Option<u32>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Explicit path > `./prf-tool.toml` if present > none.
pub fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            [device]
            path = "/dev/spidev1.0"
            transport = "usb_stream"
            speed_hz = 1000000
            protocol = 2

            [monitor]
            poll_interval_ms = 250

            [[monitor.events]]
            event_id = 1
            zone_id = 42
            label = "flood"

            [[monitor.events]]
            event_id = 2
            zone_id = 42
            command = "true"

            [logging]
            retention_days = 3

            [dfu]
            max_block_retries = 5
        "#;
        let config: ConfigFile = toml::from_str(text).unwrap();
        assert_eq!(config.device.path.as_deref(), Some("/dev/spidev1.0"));
        assert_eq!(config.device.transport, Some(TransportKind::UsbStream));
        assert_eq!(config.device.speed_hz, Some(1_000_000));
        assert_eq!(config.monitor.poll_interval_ms, Some(250));
        assert_eq!(config.monitor.events.len(), 2);
        assert_eq!(config.monitor.events[0].key(), EventKey::new(1, 42));
        assert_eq!(config.monitor.events[0].display_label(), "flood");
        assert_eq!(config.monitor.events[1].display_label(), "event 2 zone 42");
        assert_eq!(config.logging.retention_days, Some(3));
        assert_eq!(config.dfu.max_block_retries, Some(5));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert!(config.device.path.is_none());
        assert!(config.monitor.events.is_empty());
    }

    #[test]
    fn test_load_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[device\npath = 1").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            load_config(Path::new("/nonexistent/prf-tool.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_locate_explicit() {
        let path = Path::new("custom.toml");
        assert_eq!(locate_config(Some(path)), Some(PathBuf::from("custom.toml")));
    }
}
