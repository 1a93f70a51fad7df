#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cloudsync::config::ClientConfig;
use cloudsync::connection::{Connection, FrameReader};
use cloudsync::server::{self, ServerRegistry};
use cloudsync::status::StatusSink;
use cloudsync::Message;
use tokio::net::{TcpListener, TcpStream};

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<ServerRegistry>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serve `root` on a free loopback port.
pub async fn start_server(root: &Path, sink: Arc<dyn StatusSink>) -> Result<TestServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let registry = ServerRegistry::new(root, Duration::from_millis(5), sink)?;
    let reg = registry.clone();
    let task = tokio::spawn(async move {
        let _ = server::serve_listener(listener, reg).await;
    });
    Ok(TestServer {
        addr,
        registry,
        task,
    })
}

/// A client speaking the wire protocol directly, without a watched folder.
pub struct RawClient {
    pub conn: Arc<Connection>,
    pub reader: FrameReader,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (conn, reader) = Connection::from_tcp(stream);
        Ok(Self { conn, reader })
    }

    pub async fn greet(addr: SocketAddr, username: &str) -> Result<Self> {
        let client = Self::connect(addr).await?;
        client.send(Message::Greeting {
            username: username.to_string(),
        })
        .await?;
        Ok(client)
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.conn.send(&msg).await?;
        Ok(())
    }

    /// Next message, failing the test if nothing arrives within two seconds.
    pub async fn recv(&mut self) -> Result<Message> {
        Ok(tokio::time::timeout(Duration::from_secs(2), self.reader.receive_next()).await??)
    }
}

pub fn client_config(addr: SocketAddr, username: &str, folder: &Path) -> ClientConfig {
    ClientConfig {
        server: addr.to_string(),
        username: username.to_string(),
        folder: folder.to_path_buf(),
        poll_interval_ms: 20,
        stability_retry_ms: 5,
        ..ClientConfig::default()
    }
}

/// Poll `cond` every 10ms for up to five seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500u32 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("timed out waiting for {}", what)
}
