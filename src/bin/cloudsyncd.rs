use anyhow::{Context, Result};
use clap::Parser;

use cloudsync::cli::{self, DaemonOpts};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    cli::init_tracing(opts.json_logs);
    let create_root = opts.create_root;
    let log_file = opts.log_file.clone();
    let mut config = opts.into_config()?;

    if !config.root.exists() {
        if create_root {
            std::fs::create_dir_all(&config.root)
                .with_context(|| format!("Failed to create root directory: {}", config.root.display()))?;
        } else {
            anyhow::bail!("Root directory does not exist: {}", config.root.display());
        }
    }
    if !config.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", config.root.display());
    }
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to 0.0.0.0 exposes the unencrypted protocol on every interface");
    }

    let sink = cli::file_sink(log_file.as_deref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;

    rt.block_on(async move {
        tokio::select! {
            res = cloudsync::server::serve(&config, sink) => res,
            _ = stop_rx.recv() => {
                tracing::info!("interrupted, shutting down");
                Ok(())
            }
        }
    })
}
