//! Monitor configuration management.
//!
//! Configuration is stored as TOML:
//! - `$SORTHUB_CONFIG` if set
//! - Linux: `~/.config/sorthub/monitor.toml`
//! - Windows: `%APPDATA%/sorthub/monitor.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use sorthub_device_link::{ClientConfig, ReconnectConfig};

/// Command line of the station monitor.
#[derive(Parser)]
#[command(name = "sorthub-monitor", about = "SortHub station monitor")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a custom configuration file.
    #[arg(long, global = true, env = "SORTHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device server endpoint override (`host:port` or `ws://` URL).
    #[arg(long, short = 'e', global = true, env = "SORTHUB_DEVICE")]
    pub endpoint: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Log every event pushed by the device server until Ctrl-C.
    Watch,
    /// Print a QR label for an order and wait for the printer.
    Print {
        /// Order number, also used to match the printer's reply.
        order_number: String,
        /// Content encoded in the QR code.
        qr_data: String,
    },
    /// Ask the device server for a system status snapshot.
    Status,
}

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Name of this station, sent with test messages (hostname by default).
    #[serde(default = "default_station_name")]
    pub station_name: String,

    /// Device server endpoint.
    #[serde(default = "default_endpoint")]
    pub device_endpoint: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// `[reconnect]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            enabled: true,
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            multiplier: defaults.multiplier,
        }
    }
}

fn default_station_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "SortHub Station".into())
}

fn default_endpoint() -> String {
    "raspberrypi.local:5000".into()
}

fn default_connect_timeout() -> u64 {
    ClientConfig::default().connect_timeout.as_secs()
}

fn default_request_timeout() -> u64 {
    ClientConfig::default().request_timeout.as_secs()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            station_name: default_station_name(),
            device_endpoint: default_endpoint(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            reconnect: ReconnectSection::default(),
        }
    }
}

impl MonitorConfig {
    /// Loads configuration from `path` (or the default location), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: MonitorConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = MonitorConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Client settings for the device link.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            auto_reconnect: self.reconnect.enabled,
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect.max_attempts,
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                multiplier: self.reconnect.multiplier,
            },
            ..ClientConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .map_err(|_| anyhow::anyhow!("APPDATA is not set"))?;
        Ok(PathBuf::from(appdata).join("sorthub").join("monitor.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("sorthub")
            .join("monitor.toml"))
    }
}
