//! Status notifications and observable lists for a presentation layer
//!
//! Sessions report human-readable events through a [`StatusSink`]. Every
//! implementation returns without waiting on its consumer, so a slow front
//! end never stalls protocol I/O.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Connected { server: String },
    GreetingSent { username: String },
    GoodbyeSent,
    /// A file went out on a connection; `to` names the user for relays
    Sent { file: String, to: Option<String> },
    DeletionsSent { count: usize },
    RelayRequested { file: String, to: String },
    /// Incoming file written to disk
    Saved { file: String },
    SaveFailed { file: String, reason: String },
    Deleted { file: String },
    DeleteFailed { file: String, reason: String },
    FilesListSent { to: String },
    UsersListSent { to: String },
    FilesListReceived { count: usize },
    UsersListReceived { count: usize },
    DirectoryCreated { path: String },
    Joined { user: String },
    Left { user: String },
    RelayDropped { file: String, to: String },
    /// Relay request naming something other than a plain file name
    RelayRejected { file: String, reason: String },
    Error { context: String, message: String },
    Closed,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Connected { server } => write!(f, "CONNECTED: {}", server),
            StatusEvent::GreetingSent { username } => {
                write!(f, "SENT: greeting as {}", username)
            }
            StatusEvent::GoodbyeSent => write!(f, "SENT: goodbye to server"),
            StatusEvent::Sent { file, to: None } => write!(f, "SENT: {}", file),
            StatusEvent::Sent { file, to: Some(to) } => write!(f, "SENT: {} to {}", file, to),
            StatusEvent::DeletionsSent { count } => {
                write!(f, "SENT: {} file(s) to delete", count)
            }
            StatusEvent::RelayRequested { file, to } => {
                write!(f, "SENT: request to relay {} to {}", file, to)
            }
            StatusEvent::Saved { file } => write!(f, "SAVED: {}", file),
            StatusEvent::SaveFailed { file, reason } => {
                write!(f, "ERROR WHEN SAVING: {} ({})", file, reason)
            }
            StatusEvent::Deleted { file } => write!(f, "DELETED: {}", file),
            StatusEvent::DeleteFailed { file, reason } => {
                write!(f, "ERROR WHEN DELETING: {} ({})", file, reason)
            }
            StatusEvent::FilesListSent { to } => write!(f, "SENT: list of files to {}", to),
            StatusEvent::UsersListSent { to } => write!(f, "SENT: list of users to {}", to),
            StatusEvent::FilesListReceived { count } => {
                write!(f, "RECEIVED: list of {} file(s)", count)
            }
            StatusEvent::UsersListReceived { count } => {
                write!(f, "RECEIVED: list of {} user(s)", count)
            }
            StatusEvent::DirectoryCreated { path } => write!(f, "CREATED: directory {}", path),
            StatusEvent::Joined { user } => write!(f, "JOINED: {}", user.to_uppercase()),
            StatusEvent::Left { user } => write!(f, "LEFT: {}", user.to_uppercase()),
            StatusEvent::RelayDropped { file, to } => {
                write!(f, "DROPPED: relay of {} to unknown user {}", file, to)
            }
            StatusEvent::RelayRejected { file, reason } => {
                write!(f, "REJECTED: relay of {} ({})", file, reason)
            }
            StatusEvent::Error { context, message } => write!(f, "ERROR: {}: {}", context, message),
            StatusEvent::Closed => write!(f, "CLOSED: session ended"),
        }
    }
}

pub trait StatusSink: Send + Sync {
    fn emit(&self, _event: StatusEvent) {}
}

pub struct NoopSink;
impl StatusSink for NoopSink {}

/// Forwards status lines into the `tracing` diagnostics stream.
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn emit(&self, event: StatusEvent) {
        match event {
            StatusEvent::Error { .. }
            | StatusEvent::SaveFailed { .. }
            | StatusEvent::DeleteFailed { .. }
            | StatusEvent::RelayRejected { .. } => tracing::warn!("{}", event),
            _ => tracing::info!("{}", event),
        }
    }
}

/// Hands events to an unbounded channel; the receiver is the presentation
/// layer's queue.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn emit(&self, event: StatusEvent) {
        // A dropped receiver just means nobody is watching any more
        let _ = self.tx.send(event);
    }
}

/// Runs a blocking sink on its own thread so `emit` only enqueues.
///
/// File-backed sinks go through this; the writer thread exits once every
/// clone of the sink is dropped and the queue has drained.
#[derive(Clone)]
pub struct BackgroundSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl BackgroundSink {
    pub fn spawn(inner: Box<dyn StatusSink>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusEvent>();
        std::thread::Builder::new()
            .name("status-writer".into())
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    inner.emit(event);
                }
            })?;
        Ok(Self { tx })
    }
}

impl StatusSink for BackgroundSink {
    fn emit(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Timestamped human-readable lines appended to a file.
pub struct TextSink {
    file: Mutex<File>,
}

impl TextSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(open_append(path.as_ref())?),
        })
    }
}

impl StatusSink for TextSink {
    fn emit(&self, event: StatusEvent) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), event);
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a StatusEvent,
}

/// One JSON object per event, for machine consumers.
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(open_append(path.as_ref())?),
        })
    }
}

impl StatusSink for JsonlSink {
    fn emit(&self, event: StatusEvent) {
        let line = JsonLine {
            timestamp: Utc::now().to_rfc3339(),
            event: &event,
        };
        let mut f = self.file.lock();
        if serde_json::to_writer(&mut *f, &line).is_ok() {
            let _ = f.write_all(b"\n");
        }
    }
}

/// Replace-all list published to any number of readers.
#[derive(Clone)]
pub struct ObservableList {
    tx: Arc<watch::Sender<Vec<String>>>,
}

impl Default for ObservableList {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservableList {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn replace(&self, items: Vec<String>) {
        self.tx.send_replace(items);
    }

    pub fn get(&self) -> Vec<String> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.tx.subscribe()
    }
}
