//! Client session: mirrors one local folder to the server
//!
//! After connecting and greeting, two loops run until shutdown:
//! - the watch loop polls the folder, spawns one send task per added file
//!   and reports removals in a single DeletedList per cycle
//! - the reader loop saves relayed files and refreshes the user/file lists
//!
//! Every outbound message goes through the one `Connection`, so sends from
//! the per-file tasks, relay requests and the final Goodbye never interleave.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, FrameReader};
use crate::error::{Result, SyncError};
use crate::protocol_core::{path_in_dir, Message};
use crate::status::{ObservableList, StatusEvent, StatusSink};
use crate::storage;
use crate::url::parse_server_addr;
use crate::watcher::{self, FolderWatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// Precheck run by the caller before [`ClientSession::connect`].
pub fn validate_credentials(username: &str, folder: &Path) -> Result<()> {
    if username.trim().is_empty() {
        return Err(SyncError::Credentials("username is empty".into()));
    }
    if folder.as_os_str().is_empty() {
        return Err(SyncError::Credentials("folder path is empty".into()));
    }
    if !folder.is_dir() {
        return Err(SyncError::Credentials(format!(
            "invalid folder path: {}",
            folder.display()
        )));
    }
    Ok(())
}

pub struct ClientSession {
    username: String,
    conn: Arc<Connection>,
    state: Arc<Mutex<SessionState>>,
    users: ObservableList,
    files: ObservableList,
    sink: Arc<dyn StatusSink>,
    watch_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

/// State shared by the two loops and the per-file send tasks.
#[derive(Clone)]
struct Shared {
    conn: Arc<Connection>,
    state: Arc<Mutex<SessionState>>,
    folder: PathBuf,
    sink: Arc<dyn StatusSink>,
}

impl Shared {
    /// Tear the session down after a fatal error on either loop.
    fn fail(&self, context: &str, err: &SyncError) {
        let was_closing = {
            let mut st = self.state.lock();
            let was = *st == SessionState::Closing || *st == SessionState::Closed;
            *st = SessionState::Closed;
            was
        };
        if !was_closing {
            warn!(error = %err, "{}", context);
            self.sink.emit(StatusEvent::Error {
                context: context.to_string(),
                message: err.to_string(),
            });
            self.sink.emit(StatusEvent::Closed);
        }
        self.conn.close();
    }
}

impl ClientSession {
    /// Connect, greet and start both loops.
    pub async fn connect(config: &ClientConfig, sink: Arc<dyn StatusSink>) -> Result<Self> {
        let state = Arc::new(Mutex::new(SessionState::Connecting));
        let addr = parse_server_addr(&config.server)
            .map(|a| a.to_string())
            .ok_or_else(|| SyncError::Connect {
                addr: config.server.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad server address"),
            })?;

        let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(SyncError::Connect { addr, source: e }),
            Err(_) => {
                return Err(SyncError::Connect {
                    addr,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timeout"),
                })
            }
        };
        let (conn, reader) = Connection::from_tcp(stream);
        info!(server = %addr, "connected");
        sink.emit(StatusEvent::Connected { server: addr });

        Self::start(conn, reader, config, sink, state).await
    }

    async fn start(
        conn: Arc<Connection>,
        reader: FrameReader,
        config: &ClientConfig,
        sink: Arc<dyn StatusSink>,
        state: Arc<Mutex<SessionState>>,
    ) -> Result<Self> {
        *state.lock() = SessionState::Handshaking;
        conn.send(&Message::Greeting {
            username: config.username.clone(),
        })
        .await?;
        sink.emit(StatusEvent::GreetingSent {
            username: config.username.clone(),
        });
        *state.lock() = SessionState::Active;

        let shared = Shared {
            conn: conn.clone(),
            state: state.clone(),
            folder: config.folder.clone(),
            sink: sink.clone(),
        };
        let users = ObservableList::new();
        let files = ObservableList::new();

        let watch_task = tokio::spawn(watch_loop(
            shared.clone(),
            config.poll_interval(),
            config.stability_retry(),
        ));
        let reader_task = tokio::spawn(reader_loop(shared, reader, users.clone(), files.clone()));

        Ok(Self {
            username: config.username.clone(),
            conn,
            state,
            users,
            files,
            sink,
            watch_task,
            reader_task,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Other users currently online, as last reported by the server.
    pub fn users(&self) -> ObservableList {
        self.users.clone()
    }

    /// This client's files as the server last reported them.
    pub fn files(&self) -> ObservableList {
        self.files.clone()
    }

    /// Resolves when the session ends for any reason.
    pub async fn closed(&self) {
        self.conn.closed().await
    }

    /// Ask the server to send `filename` from this client's storage to
    /// `target`. The server drops requests for unknown users silently.
    pub async fn request_relay(&self, filename: &str, target: &str) -> Result<()> {
        if self.state() != SessionState::Active {
            return Err(SyncError::Closed);
        }
        self.conn
            .send(&Message::RelayRequest {
                filename: filename.to_string(),
                target: target.to_string(),
            })
            .await?;
        self.sink.emit(StatusEvent::RelayRequested {
            file: filename.to_string(),
            to: target.to_string(),
        });
        Ok(())
    }

    /// Send Goodbye, close the connection and wait for both loops to stop.
    pub async fn shutdown(self) -> Result<()> {
        let was_active = {
            let mut st = self.state.lock();
            let was = *st == SessionState::Active;
            if was {
                *st = SessionState::Closing;
            }
            was
        };
        let res = if was_active {
            let r = self.conn.send(&Message::Goodbye).await;
            if r.is_ok() {
                self.sink.emit(StatusEvent::GoodbyeSent);
            }
            r
        } else {
            Ok(())
        };
        self.conn.shutdown().await;
        let _ = self.watch_task.await;
        let _ = self.reader_task.await;
        if was_active {
            *self.state.lock() = SessionState::Closed;
            self.sink.emit(StatusEvent::Closed);
        }
        res
    }
}

async fn watch_loop(shared: Shared, interval: Duration, retry: Duration) {
    let mut watcher = FolderWatcher::new(shared.folder.clone(), interval);
    loop {
        let delta = tokio::select! {
            _ = shared.conn.closed() => break,
            delta = watcher.next_delta() => delta,
        };
        let delta = match delta {
            Ok(d) => d,
            Err(e) => {
                shared.fail("watching local folder", &e);
                break;
            }
        };
        if delta.is_empty() {
            continue;
        }
        debug!(added = delta.added.len(), removed = delta.removed.len(), "folder changed");

        for name in delta.added {
            tokio::spawn(send_file(shared.clone(), name, retry));
        }
        if !delta.removed.is_empty() {
            let count = delta.removed.len();
            let msg = Message::DeletedList(delta.removed.into_iter().collect());
            match shared.conn.send(&msg).await {
                Ok(()) => shared.sink.emit(StatusEvent::DeletionsSent { count }),
                Err(e) => {
                    shared.fail("sending deletions", &e);
                    break;
                }
            }
        }
    }
}

async fn send_file(shared: Shared, name: String, retry: Duration) {
    let res = async {
        let path = path_in_dir(&shared.folder, &name)?;
        watcher::wait_until_stable(&path, retry).await?;
        let contents = storage::read_file(&shared.folder, &name)?;
        shared
            .conn
            .send(&Message::FileTransfer {
                filename: name.clone(),
                contents,
            })
            .await
    }
    .await;
    match res {
        Ok(()) => shared.sink.emit(StatusEvent::Sent {
            file: name,
            to: None,
        }),
        Err(e) if e.is_connection_error() => shared.fail("sending file", &e),
        Err(e) => {
            warn!(file = %name, error = %e, "skipping file");
            shared.sink.emit(StatusEvent::Error {
                context: format!("sending {}", name),
                message: e.to_string(),
            });
        }
    }
}

async fn reader_loop(
    shared: Shared,
    mut reader: FrameReader,
    users: ObservableList,
    files: ObservableList,
) {
    loop {
        let msg = match reader.receive_next().await {
            Ok(m) => m,
            Err(e) => {
                shared.fail("reading from server", &e);
                break;
            }
        };
        match msg {
            Message::FileTransfer { filename, contents } => {
                match storage::save_new_file(&shared.folder, &filename, &contents) {
                    Ok(_) => {
                        info!(file = %filename, bytes = contents.len(), "saved incoming file");
                        shared.sink.emit(StatusEvent::Saved { file: filename });
                    }
                    Err(e) => {
                        warn!(file = %filename, error = %e, "incoming file not saved");
                        shared.sink.emit(StatusEvent::SaveFailed {
                            file: filename,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Message::FilesList(list) => {
                let count = list.len();
                files.replace(list);
                shared.sink.emit(StatusEvent::FilesListReceived { count });
            }
            Message::UsersList(list) => {
                let count = list.len();
                users.replace(list);
                shared.sink.emit(StatusEvent::UsersListReceived { count });
            }
            other => {
                let e = SyncError::Protocol(format!("unexpected {} from server", other.name()));
                shared.fail("reading from server", &e);
                break;
            }
        }
    }
}
