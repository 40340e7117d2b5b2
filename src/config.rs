//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the aq-config.toml file.
//! It provides a centralized way to configure device identity, WiFi and broker
//! credentials, sensor wiring, the configuration portal and the storage image.
//!
//! None of these values change at runtime: the publish cadence, sensor retry
//! policies and topics are fixed in code, and the only runtime-mutable value
//! (the location label) lives in the [`store`](crate::store).

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "aq-config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    /// UTC offset is not of the form `±HH:MM`
    #[error("invalid utc_offset '{0}', expected ±HH:MM")]
    UtcOffset(String),

    /// A required field is empty
    #[error("{0} must not be empty")]
    Missing(&'static str),

    #[error("config IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialize: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration loaded from aq-config.toml
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub wifi: WifiConfig,
    pub broker: BrokerConfig,
    pub sensors: SensorsConfig,
    pub portal: PortalConfig,
    pub storage: StorageConfig,
}

/// Identity fields copied into every message header
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Owner identifier, sent as `userUUID`
    pub user_uuid: String,
    /// Device identifier, sent as `deviceId` and in status payloads
    pub device_id: String,
    /// Static offset appended to timestamps (e.g. "-05:00"). No timezone
    /// database is consulted.
    pub utc_offset: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    /// Network interface checked for association (e.g. "wlan0")
    pub interface: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Empty username disables authentication
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u64,
}

/// Sensor wiring
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorsConfig {
    /// UART carrying the GPS NMEA stream
    pub gps_port: String,
    pub gps_baud: u32,
    /// UART of the MH-Z19 CO2 sensor
    pub co2_port: String,
    /// UART of the SDS011 particulate sensor
    pub pm_port: String,
    /// w1-therm device directory of the DS18B20
    pub w1_device: String,
}

/// Configuration portal (location label form)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// File backing the non-volatile image that holds the location label
    pub path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig {
                user_uuid: "00000000-0000-0000-0000-000000000000".to_string(),
                device_id: "aq-node-01".to_string(),
                utc_offset: "-05:00".to_string(),
            },
            wifi: WifiConfig {
                ssid: String::new(),
                password: String::new(),
                interface: "wlan0".to_string(),
            },
            broker: BrokerConfig {
                host: "localhost".to_string(),
                port: 1883,
                client_id: "aq-node-01".to_string(),
                username: String::new(),
                password: String::new(),
                keep_alive_secs: 15,
            },
            sensors: SensorsConfig {
                gps_port: "/dev/ttyAMA1".to_string(),
                gps_baud: 9600,
                co2_port: "/dev/ttyAMA2".to_string(),
                pm_port: "/dev/ttyAMA3".to_string(),
                w1_device: "/sys/bus/w1/devices/28-000000000000".to_string(),
            },
            portal: PortalConfig {
                enabled: true,
                bind: "0.0.0.0:8080".to_string(),
            },
            storage: StorageConfig {
                path: "aq-node.eeprom".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    info!(device = %config.device.device_id, "loaded configuration");
                    config
                }
                Err(e) => {
                    warn!("invalid config file format: {e}");
                    warn!("using default configuration");
                    Self::default()
                }
            },
            Err(_) => {
                info!(
                    path = %path.as_ref().display(),
                    "no config file found, using default configuration"
                );
                Self::default()
            }
        }
    }

    /// Save current configuration to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        info!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }

    /// Check the fields the node cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.utc_offset()?;
        if self.device.device_id.is_empty() {
            return Err(ConfigError::Missing("device.device_id"));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Missing("broker.host"));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Missing("broker.client_id"));
        }
        for (name, port) in [
            ("sensors.gps_port", &self.sensors.gps_port),
            ("sensors.co2_port", &self.sensors.co2_port),
            ("sensors.pm_port", &self.sensors.pm_port),
        ] {
            if port.is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        Ok(())
    }

    /// Parsed `device.utc_offset`.
    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_utc_offset(&self.device.utc_offset)
    }

    /// Log the loaded configuration with secrets masked.
    pub fn log_summary(&self) {
        let mask = |s: &str| if s.is_empty() { "" } else { "****" };
        info!("configuration:");
        info!("  device     : {} ({})", self.device.device_id, self.device.utc_offset);
        info!("  wifi       : ssid='{}' iface={} pass={}", self.wifi.ssid, self.wifi.interface, mask(&self.wifi.password));
        info!(
            "  broker     : {}:{} id={} user='{}' pass={}",
            self.broker.host,
            self.broker.port,
            self.broker.client_id,
            self.broker.username,
            mask(&self.broker.password)
        );
        info!("  gps        : {} @ {}", self.sensors.gps_port, self.sensors.gps_baud);
        info!("  co2 / pm   : {} / {}", self.sensors.co2_port, self.sensors.pm_port);
        info!("  w1 probe   : {}", self.sensors.w1_device);
        info!("  portal     : {} (enabled={})", self.portal.bind, self.portal.enabled);
        info!("  storage    : {}", self.storage.path);
    }
}

/// Parse a `±HH:MM` offset.
pub fn parse_utc_offset(text: &str) -> Result<FixedOffset, ConfigError> {
    let err = || ConfigError::UtcOffset(text.to_string());
    let bytes = text.as_bytes();
    if bytes.len() != 6 || bytes[3] != b':' {
        return Err(err());
    }
    if ![1, 2, 4, 5].iter().all(|&i| bytes[i].is_ascii_digit()) {
        return Err(err());
    }
    let sign = match bytes[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return Err(err()),
    };
    let hours: i32 = text[1..3].parse().map_err(|_| err())?;
    let minutes: i32 = text[4..6].parse().map_err(|_| err())?;
    if hours > 23 || minutes > 59 {
        return Err(err());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(err)
}
