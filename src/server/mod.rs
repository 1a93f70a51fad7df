//! Server: accept loop, session registry and per-client sessions

pub mod registry;
pub mod session;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::status::StatusSink;

pub use registry::ServerRegistry;
pub use session::{SessionHandle, UserSession};

/// Bind `config.bind` and serve forever.
pub async fn serve(config: &ServerConfig, sink: Arc<dyn StatusSink>) -> Result<()> {
    let registry = ServerRegistry::new(&config.root, config.stability_retry(), sink)
        .with_context(|| format!("open storage root {}", config.root.display()))?;
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(
        bind = %config.bind,
        root = %config.root.display(),
        "cloudsyncd listening"
    );
    serve_listener(listener, registry).await
}

/// Accept connections on an already-bound listener. A failed accept or
/// directory allocation drops that one connection and keeps serving.
pub async fn serve_listener(listener: TcpListener, registry: Arc<ServerRegistry>) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = registry.accept(stream) {
            error!(peer = %peer, error = %e, "could not start session");
        }
    }
}
