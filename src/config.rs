//! TOML configuration for the client and the server
//!
//! Precedence is defaults < config file < command-line flags; the flag layer
//! is applied in `cli`.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::{timeouts, DEFAULT_PORT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address: `cloud://host:port`, `host:port` or `host`
    pub server: String,
    pub username: String,
    /// Local folder mirrored to the server
    pub folder: PathBuf,
    pub poll_interval_ms: u64,
    pub stability_retry_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("localhost:{}", DEFAULT_PORT),
            username: String::new(),
            folder: PathBuf::new(),
            poll_interval_ms: timeouts::POLL_INTERVAL_MS,
            stability_retry_ms: timeouts::STABILITY_RETRY_MS,
            connect_timeout_ms: timeouts::CONNECT_MS,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(self, path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stability_retry(&self) -> Duration {
        Duration::from_millis(self.stability_retry_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Directory holding the `client_<n>` storage areas
    pub root: PathBuf,
    pub stability_retry_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", DEFAULT_PORT),
            root: PathBuf::from("Cloud"),
            stability_retry_ms: timeouts::STABILITY_RETRY_MS,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn stability_retry(&self) -> Duration {
        Duration::from_millis(self.stability_retry_ms)
    }
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&data).with_context(|| format!("Invalid config file: {}", path.display()))
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).ok();
    let data = toml::to_string(value)?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}
