//! # Configuration Management
//!
//! Loads runtime settings from `sail-gateway.toml`. Every section and key is
//! optional; anything missing takes its default, and an unreadable or
//! invalid file falls back to the full default configuration.
//!
//! ```toml
//! [serial]
//! device = "/dev/serial0"
//! baud = 4800
//! replay_file = "captures/harbour.nmea"
//!
//! [storage]
//! data_dir = "/var/lib/sail-gateway"
//!
//! [schedule]
//! priorities_ms = 500
//! serial_budget_ms = 50
//!
//! [onewire]
//! saildrive = "26A1B2C3D4E5F6D3"
//!
//! [logging]
//! level = "info"
//! event_buffer = 64
//! event_min_level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::events::Level;
use crate::onewire::{self, Address, DeviceRole};
use crate::Millis;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "sail-gateway.toml";

/// Application configuration loaded from sail-gateway.toml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub onewire: OneWireConfig,
    pub logging: LoggingConfig,
}

/// NMEA 0183 serial input
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// UART device (used with the `hardware` feature)
    pub device: String,
    pub baud: u32,
    /// NMEA 0183 capture replayed at line speed instead of a live port
    pub replay_file: Option<PathBuf>,
}

/// Persistent storage
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `calibration.json`
    pub data_dir: PathBuf,
}

/// Task cadences of the cooperative loop, milliseconds
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub nmea0183_ms: Millis,
    pub nmea2000_ms: Millis,
    pub saildrive_ms: Millis,
    pub battery_ms: Millis,
    pub shore_power_ms: Millis,
    pub priorities_ms: Millis,
    pub stale_sweep_ms: Millis,
    pub loop_stats_ms: Millis,
    /// Longest time one serial drain may run
    pub serial_budget_ms: Millis,
    /// Minimum gap between two 1-Wire reads
    pub onewire_spacing_ms: Millis,
}

/// Fixed 1-Wire addresses as 16 hex digits, family code first.
/// Unset roles take family-0x26 devices in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OneWireConfig {
    pub saildrive: Option<String>,
    pub battery_a: Option<String>,
    pub battery_b: Option<String>,
    pub shore_power: Option<String>,
}

/// Logging and event stream
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter for the console log (e.g. "info", "sail_gateway_lib=debug")
    pub level: String,
    /// Capacity of the event ring drained by the log stream
    pub event_buffer: usize,
    /// Lowest level kept in the event ring
    pub event_min_level: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            device: "/dev/serial0".to_string(),
            baud: 4800,
            replay_file: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("/var/lib/sail-gateway"),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            nmea0183_ms: 10,
            nmea2000_ms: 10,
            saildrive_ms: 1000,
            battery_ms: 2000,
            shore_power_ms: 2000,
            priorities_ms: 500,
            stale_sweep_ms: 1000,
            loop_stats_ms: 5000,
            serial_budget_ms: 50,
            onewire_spacing_ms: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            event_buffer: 64,
            event_min_level: "info".to_string(),
        }
    }
}

impl OneWireConfig {
    /// Parsed addresses indexed like [`DeviceRole::ALL`]. Invalid entries are
    /// logged and treated as unset.
    pub fn addresses(&self) -> [Option<Address>; 4] {
        let mut addresses = [None; 4];
        for (slot, role) in DeviceRole::ALL.iter().enumerate() {
            let text = match role {
                DeviceRole::Saildrive => &self.saildrive,
                DeviceRole::BatteryA => &self.battery_a,
                DeviceRole::BatteryB => &self.battery_b,
                DeviceRole::ShorePower => &self.shore_power,
            };
            if let Some(text) = text {
                addresses[slot] = onewire::parse_address(text);
                if addresses[slot].is_none() {
                    tracing::warn!(
                        role = role.name(),
                        address = %text,
                        "ignoring invalid 1-Wire address"
                    );
                }
            }
        }
        addresses
    }
}

impl LoggingConfig {
    /// Minimum event ring level, INFO when the name is not recognised.
    pub fn event_level(&self) -> Level {
        Level::parse(&self.event_min_level).unwrap_or(Level::Info)
    }
}

impl Config {
    /// Load configuration from sail-gateway.toml
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "invalid config file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Write the current configuration to `path` as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        tracing::info!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }
}
