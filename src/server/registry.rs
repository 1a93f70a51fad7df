//! Server-wide table of live sessions
//!
//! Sessions enter the table unkeyed on accept and become keyed by username
//! once they greet. Only keyed sessions take part in the user-list
//! broadcast and relay lookups.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{Result, SyncError};
use crate::protocol_core::Message;
use crate::status::{StatusEvent, StatusSink};
use crate::storage;

use super::session::{SessionHandle, UserSession};

struct Entry {
    handle: Arc<SessionHandle>,
    username: Option<String>,
}

pub struct ServerRegistry {
    root: PathBuf,
    stability_retry: Duration,
    sink: Arc<dyn StatusSink>,
    // Join order doubles as broadcast iteration order
    sessions: Mutex<Vec<Entry>>,
    // Serializes whole broadcasts so a stale list never lands after a newer one
    broadcast_lock: tokio::sync::Mutex<()>,
}

impl ServerRegistry {
    pub fn new(root: &Path, stability_retry: Duration, sink: Arc<dyn StatusSink>) -> Result<Arc<Self>> {
        if !root.is_dir() {
            return Err(SyncError::path(root, "storage root is not an existing directory"));
        }
        Ok(Arc::new(Self {
            root: root.to_path_buf(),
            stability_retry,
            sink,
            sessions: Mutex::new(Vec::new()),
            broadcast_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn sink(&self) -> &Arc<dyn StatusSink> {
        &self.sink
    }

    /// Allocate a storage directory, register the session unkeyed and start
    /// its reader task.
    pub fn accept(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<SessionHandle>> {
        let (id, dir) = storage::allocate_client_dir(&self.root)?;
        self.sink.emit(StatusEvent::DirectoryCreated {
            path: dir.display().to_string(),
        });
        let (conn, reader) = Connection::from_tcp(stream);
        let handle = Arc::new(SessionHandle::new(conn, dir, self.stability_retry));
        info!(
            session = %handle.id(),
            peer = %handle.conn().peer(),
            dir = %handle.storage_dir().display(),
            "accepted client {}",
            id
        );

        self.insert(handle.clone());
        let session = UserSession::new(handle.clone(), reader, self.clone());
        tokio::spawn(session.run());
        Ok(handle)
    }

    pub(crate) fn insert(&self, handle: Arc<SessionHandle>) {
        self.sessions.lock().push(Entry {
            handle,
            username: None,
        });
    }

    /// Key a session by username. Fails if another keyed session already
    /// holds the name.
    pub fn register(&self, id: Uuid, username: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions
            .iter()
            .any(|e| e.handle.id() != id && e.username.as_deref() == Some(username))
        {
            return Err(SyncError::UsernameTaken(username.to_string()));
        }
        match sessions.iter_mut().find(|e| e.handle.id() == id) {
            Some(entry) => {
                entry.username = Some(username.to_string());
                Ok(())
            }
            None => Err(SyncError::Closed),
        }
    }

    /// Greeting path: key the session, then tell everyone.
    pub async fn on_greeting(&self, id: Uuid, username: &str) -> Result<()> {
        self.register(id, username)?;
        self.broadcast_users().await;
        Ok(())
    }

    /// Drop a session from the table. The storage directory stays on disk.
    pub fn remove(&self, id: Uuid) -> Option<String> {
        let mut sessions = self.sessions.lock();
        let pos = sessions.iter().position(|e| e.handle.id() == id)?;
        sessions.remove(pos).username
    }

    /// Leave path: remove, then broadcast if the session was keyed.
    pub async fn leave(&self, id: Uuid) -> Option<String> {
        let username = self.remove(id);
        if username.is_some() {
            self.broadcast_users().await;
        }
        username
    }

    pub fn resolve(&self, username: &str) -> Option<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .iter()
            .find(|e| e.username.as_deref() == Some(username))
            .map(|e| e.handle.clone())
    }

    /// Usernames of keyed sessions, in join order.
    pub fn usernames(&self) -> Vec<String> {
        self.sessions
            .lock()
            .iter()
            .filter_map(|e| e.username.clone())
            .collect()
    }

    /// Number of live sessions, keyed or not.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(username, known files)` for every keyed session.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.sessions
            .lock()
            .iter()
            .filter_map(|e| e.username.clone().map(|u| (u, e.handle.files().get())))
            .collect()
    }

    /// Send every keyed session the usernames of all other keyed sessions.
    ///
    /// A failed send closes that recipient; its own reader then unregisters
    /// it and triggers the next broadcast.
    pub async fn broadcast_users(&self) {
        let _serial = self.broadcast_lock.lock().await;
        let targets: Vec<(Arc<SessionHandle>, String)> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter_map(|e| e.username.clone().map(|u| (e.handle.clone(), u)))
                .collect()
        };
        let names: Vec<String> = targets.iter().map(|(_, u)| u.clone()).collect();

        for (handle, me) in &targets {
            let others: Vec<String> = names.iter().filter(|n| *n != me).cloned().collect();
            // A recipient that stops reading fails its own send after the
            // connection's stall timeout and is closed there
            match handle.conn().send(&Message::UsersList(others)).await {
                Ok(()) => {
                    debug!(user = %me, "users list sent");
                    self.sink.emit(StatusEvent::UsersListSent { to: me.clone() });
                }
                Err(e) => {
                    warn!(user = %me, error = %e, "users list not delivered");
                }
            }
        }
    }
}
