//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `relay.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides (PORT, RELAY_SERIAL_PATH, RELAY_BAUD_RATE).
//!
//! structure:
//!     - ServerConfig: http bind address, upload/front-end directories, CORS origin.
//!     - DeviceConfig: which transport to use and the serial port settings.
//!     - RelaySettings: debounce window for the device relay.
//!     - MetricsConfig: moving-average window and fallback container height.
//!     - CatalogConfig: how many videos GET /api returns.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::command::WireFormat;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub relay: RelaySettings,
    pub metrics: MetricsConfig,
    pub catalog: CatalogConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub uploads_dir: PathBuf,
    pub client_build_dir: PathBuf,
    /// "*" allows any origin
    pub allowed_origin: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Serial,
    Websocket,
    /// serial link over an in-memory port, for machines without a device
    Mock,
    Disabled,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Serial => "serial",
            TransportKind::Websocket => "websocket",
            TransportKind::Mock => "mock",
            TransportKind::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub transport: TransportKind,
    pub serial: SerialConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    /// 9600 for the servo sketch, 115200 for the esp32 firmware
    pub baud_rate: u32,
    /// retries after the first failed open
    pub open_retries: u32,
    pub retry_delay_ms: u64,
    /// wait before re-opening a port that closed underneath us
    pub reconnect_delay_ms: u64,
    /// 0 disables waiting for a reply line
    pub ack_timeout_ms: u64,
    pub wire_format: WireFormat,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelaySettings {
    pub debounce_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub window: usize,
    /// used until the browser reports a measured container height
    pub container_height_px: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    pub limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3001,
            uploads_dir: PathBuf::from("uploads"),
            client_build_dir: PathBuf::from("client").join("build"),
            allowed_origin: "*".to_string(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/tty.usbmodem2101".to_string(),
            baud_rate: 115_200,
            open_retries: 3,
            retry_delay_ms: 1000,
            reconnect_delay_ms: 1000,
            ack_timeout_ms: 1000,
            wire_format: WireFormat::Json,
        }
    }
}

impl SerialConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self { debounce_ms: 400 }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: crate::metrics::DEFAULT_WINDOW,
            container_height_px: 0.0,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            limit: crate::catalog::DEFAULT_LIMIT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// result of the config search, reported once logging is up
pub struct LoadedConfig {
    pub config: RelayConfig,
    pub source: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: RelayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        Ok(config)
    }

    /// Load with default fallback
    ///
    /// an explicit path must load; the implicit search only warns.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<LoadedConfig> {
        if let Some(path) = explicit {
            return Ok(LoadedConfig {
                config: Self::load(path)?,
                source: Some(path.to_path_buf()),
                warnings: Vec::new(),
            });
        }

        let paths = [
            PathBuf::from("config").join("relay.toml"),
            PathBuf::from("..").join("config").join("relay.toml"),
        ];

        let mut warnings = Vec::new();
        for path in paths {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => {
                        return Ok(LoadedConfig {
                            config,
                            source: Some(path),
                            warnings,
                        })
                    }
                    Err(e) => warnings.push(format!("Failed to load {}: {:#}", path.display(), e)),
                }
            }
        }

        warnings.push("No config file found - using defaults".to_string());
        Ok(LoadedConfig {
            config: Self::default(),
            source: None,
            warnings,
        })
    }

    /// apply PORT / RELAY_SERIAL_PATH / RELAY_BAUD_RATE from the process environment
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// returns a warning for each variable that was set but unusable
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(port) = lookup("PORT") {
            match port.trim().parse() {
                Ok(p) => self.server.port = p,
                Err(_) => warnings.push(format!("Ignoring invalid PORT={port}")),
            }
        }
        if let Some(path) = lookup("RELAY_SERIAL_PATH").filter(|p| !p.trim().is_empty()) {
            self.device.serial.path = path.trim().to_string();
        }
        if let Some(baud) = lookup("RELAY_BAUD_RATE") {
            match baud.trim().parse() {
                Ok(b) => self.device.serial.baud_rate = b,
                Err(_) => warnings.push(format!("Ignoring invalid RELAY_BAUD_RATE={baud}")),
            }
        }

        warnings
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.relay.debounce_ms)
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!("[CONFIG] listen: {}", self.listen_addr());
        tracing::info!("[CONFIG] transport: {}", self.device.transport);
        if matches!(self.device.transport, TransportKind::Serial | TransportKind::Mock) {
            let serial = &self.device.serial;
            tracing::info!(
                "[CONFIG] serial: {} at {} baud ({} wire, {} retries)",
                serial.path,
                serial.baud_rate,
                serial.wire_format,
                serial.open_retries
            );
        }
        tracing::info!("[CONFIG] debounce: {}ms", self.relay.debounce_ms);
        tracing::info!("[CONFIG] uploads: {}", self.server.uploads_dir.display());
        if !(100..=400).contains(&self.relay.debounce_ms) {
            tracing::warn!(
                "[CONFIG] debounce {}ms is outside the 100-400ms range the firmware was tuned for",
                self.relay.debounce_ms
            );
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [device]
            transport = "websocket"

            [device.serial]
            baud_rate = 9600
            wire_format = "csv"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.transport, TransportKind::Websocket);
        assert_eq!(config.device.serial.baud_rate, 9600);
        assert_eq!(config.device.serial.wire_format, WireFormat::Csv);
        assert_eq!(config.device.serial.open_retries, 3);
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.relay.debounce_ms, 400);
        assert_eq!(config.catalog.limit, 10);
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config: RelayConfig = toml::from_str(include_str!("../config/relay.toml")).unwrap();
        let defaults = RelayConfig::default();

        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.server.uploads_dir, defaults.server.uploads_dir);
        assert_eq!(config.device.transport, defaults.device.transport);
        assert_eq!(config.device.serial.path, defaults.device.serial.path);
        assert_eq!(config.device.serial.baud_rate, defaults.device.serial.baud_rate);
        assert_eq!(config.device.serial.wire_format, defaults.device.serial.wire_format);
        assert_eq!(config.relay.debounce_ms, defaults.relay.debounce_ms);
        assert_eq!(config.metrics.window, defaults.metrics.window);
    }

    #[test]
    fn env_overrides_port_and_serial() {
        let mut config = RelayConfig::default();
        let warnings = config.apply_env_from(|key| match key {
            "PORT" => Some("8080".to_string()),
            "RELAY_SERIAL_PATH" => Some("/dev/tty.wchusbserial110".to_string()),
            "RELAY_BAUD_RATE" => Some("fast".to_string()),
            _ => None,
        });

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.device.serial.path, "/dev/tty.wchusbserial110");
        assert_eq!(config.device.serial.baud_rate, 115_200);
        assert_eq!(warnings.len(), 1);
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(RelayConfig::load_or_default(Some(&missing)).is_err());
    }

    #[test]
    fn loads_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[relay]\ndebounce_ms = 150\n").unwrap();

        let loaded = RelayConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(loaded.config.relay.debounce_ms, 150);
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
    }
}
