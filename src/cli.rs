//! Shared CLI helpers for the `cloudsync` and `cloudsyncd` binaries

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use crate::config::{ClientConfig, ServerConfig};
use crate::status::{BackgroundSink, JsonlSink, StatusSink, TextSink, TracingSink};

/// Server daemon options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "cloudsync server: per-client storage, presence and relay")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding the client_<n> storage areas
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Create the root directory if it does not exist
    #[arg(long)]
    pub create_root: bool,

    /// TOML config file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append status events to this file (.jsonl for JSON lines)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Emit diagnostics as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl DaemonOpts {
    pub fn into_config(self) -> Result<ServerConfig> {
        let mut cfg = match &self.config {
            Some(p) => ServerConfig::load(p)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            cfg.bind = bind;
        }
        if let Some(root) = self.root {
            cfg.root = root;
        }
        Ok(cfg)
    }
}

/// Client options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "cloudsync client: mirror a local folder to a cloudsync server")]
pub struct ClientOpts {
    /// Name other users see and relay to
    #[arg(short, long)]
    pub username: Option<String>,

    /// Local folder to mirror
    #[arg(short, long)]
    pub folder: Option<PathBuf>,

    /// Server (cloud://host:port, host:port or host)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Folder poll interval in milliseconds
    #[arg(long)]
    pub poll_ms: Option<u64>,

    /// TOML config file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the merged settings back to --config and exit
    #[arg(long, requires = "config")]
    pub save_config: bool,

    /// Append status events to this file (.jsonl for JSON lines)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Emit diagnostics as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl ClientOpts {
    pub fn to_config(&self) -> Result<ClientConfig> {
        let mut cfg = match &self.config {
            Some(p) if p.exists() || !self.save_config => ClientConfig::load(p)?,
            _ => ClientConfig::default(),
        };
        if let Some(u) = &self.username {
            cfg.username = u.clone();
        }
        if let Some(f) = &self.folder {
            cfg.folder = f.clone();
        }
        if let Some(s) = &self.server {
            cfg.server = s.clone();
        }
        if let Some(ms) = self.poll_ms {
            cfg.poll_interval_ms = ms;
        }
        Ok(cfg)
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `cloudsync=info` filter.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloudsync=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // try_init: a second call (tests, embedding) keeps the first subscriber
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Status sink for a `--log-file` value: JSON lines for `*.jsonl`,
/// timestamped text otherwise, `tracing` when no file is given.
pub fn file_sink(path: Option<&Path>) -> Result<Arc<dyn StatusSink>> {
    Ok(match path {
        Some(p) if p.extension().is_some_and(|e| e == "jsonl") => {
            Arc::new(BackgroundSink::spawn(Box::new(JsonlSink::new(p)?))?)
        }
        Some(p) => Arc::new(BackgroundSink::spawn(Box::new(TextSink::new(p)?))?),
        None => Arc::new(TracingSink),
    })
}
