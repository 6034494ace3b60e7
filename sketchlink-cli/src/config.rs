//! Configuration file support for sketchlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SKETCHLINK_*)
//! 3. Local config file (./sketchlink.toml)
//! 4. Global config file (~/.config/sketchlink/config.toml)
//!
//! Clap resolves the first two; this module handles the files.

use clap::ValueEnum;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "sketchlink.toml";

/// Kind of bridge between the host and the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB-serial bridge answering in text lines.
    #[default]
    Serial,
    /// Wi-Fi bridge reachable over TCP.
    Tcp,
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred transport.
    pub transport: Option<TransportKind>,
    /// Serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Serial baud rate.
    pub baud: Option<u32>,
    /// Bridge host name or address.
    pub host: Option<String>,
    /// Bridge TCP port.
    pub tcp_port: Option<u16>,
    /// TCP connect timeout in seconds.
    pub connect_timeout_s: Option<u64>,
}

/// Upload engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Data bytes per page packet.
    pub page_size: Option<usize>,
    /// How long to wait for each ACK.
    pub ack_timeout_ms: Option<u64>,
    /// Bootloader-side timeout announced in the start packet.
    pub device_timeout_s: Option<u8>,
    /// Attempts per packet.
    pub retries: Option<u32>,
    /// Pause between attempts.
    pub retry_delay_ms: Option<u64>,
    /// Reject hex records with bad checksums.
    #[serde(default)]
    pub strict_checksum: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Ignoring invalid TOML in {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "sketchlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self { connection, upload } = other;

        let ours = &mut self.connection;
        ours.transport = connection.transport.or(ours.transport);
        ours.port = connection.port.or(ours.port.take());
        ours.baud = connection.baud.or(ours.baud);
        ours.host = connection.host.or(ours.host.take());
        ours.tcp_port = connection.tcp_port.or(ours.tcp_port);
        ours.connect_timeout_s = connection.connect_timeout_s.or(ours.connect_timeout_s);

        let ours = &mut self.upload;
        ours.page_size = upload.page_size.or(ours.page_size);
        ours.ack_timeout_ms = upload.ack_timeout_ms.or(ours.ack_timeout_ms);
        ours.device_timeout_s = upload.device_timeout_s.or(ours.device_timeout_s);
        ours.retries = upload.retries.or(ours.retries);
        ours.retry_delay_ms = upload.retry_delay_ms.or(ours.retry_delay_ms);
        if upload.strict_checksum {
            ours.strict_checksum = true;
        }
    }
}
