//! Configuration for the data-mode daemon and host tool.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DATAMODE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/datamode/config.toml
//!   3. ~/.config/datamode/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_WINDOW;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataModeConfig {
    pub link: LinkConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Receive window advertised to the peer, in frames.
    pub window: u8,
    /// Base retransmit timeout. Doubles per retry.
    pub retransmit_ms: u64,
    /// Retransmits per frame before the link is declared lost.
    pub max_retries: u8,
    /// Largest payload this side sends or accepts.
    pub max_payload: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Pre-shared secret, 64 hex chars. Empty = daemon generates one.
    pub secret_hex: String,
    /// Identity token the host presents in AUTH_PROVE.
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory files are published under.
    pub root: PathBuf,
    /// Transfer journal file.
    pub journal_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Serial device path (kind = serial).
    pub serial_device: PathBuf,
    /// Address the daemon listens on (kind = network).
    pub listen_addr: String,
    /// Address the host tool connects to.
    pub connect_addr: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            retransmit_ms: 250,
            max_retries: 5,
            max_payload: 1024,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_hex: String::new(),
            token: "host".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("files"),
            journal_path: data_dir().join("journal.bin"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Network,
            serial_device: PathBuf::from("/dev/ttyACM0"),
            listen_addr: "127.0.0.1:7070".to_string(),
            connect_addr: "127.0.0.1:7070".to_string(),
        }
    }
}

impl LinkConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("datamode")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("datamode")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DataModeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            DataModeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DATAMODE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            DataModeConfig::default().save_to(&path)?;
        }
        Ok(path)
    }

    /// Write this config to `path`, creating parent directories.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply DATAMODE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(w) = var("DATAMODE_LINK__WINDOW").and_then(|v| v.parse().ok()) {
            self.link.window = w;
        }
        if let Some(r) = var("DATAMODE_LINK__MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.link.max_retries = r;
        }
        if let Some(v) = var("DATAMODE_AUTH__SECRET_HEX") {
            self.auth.secret_hex = v;
        }
        if let Some(v) = var("DATAMODE_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        match var("DATAMODE_TRANSPORT__KIND").as_deref() {
            Some("serial") => self.transport.kind = TransportKind::Serial,
            Some("network") => self.transport.kind = TransportKind::Network,
            _ => {}
        }
        if let Some(v) = var("DATAMODE_TRANSPORT__LISTEN_ADDR") {
            self.transport.listen_addr = v;
        }
        if let Some(v) = var("DATAMODE_TRANSPORT__CONNECT_ADDR") {
            self.transport.connect_addr = v;
        }
    }
}
