//! Server half of one client connection

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, FrameReader};
use crate::error::{Result, SyncError};
use crate::protocol_core::{path_in_dir, validate_file_name, Message};
use crate::status::{ObservableList, StatusEvent};
use crate::storage;
use crate::watcher;

use super::registry::ServerRegistry;

/// The parts of a session other sessions may touch: its outbound
/// connection for broadcasts and relays, and a read-only view of its
/// known files.
pub struct SessionHandle {
    id: Uuid,
    conn: Arc<Connection>,
    storage_dir: PathBuf,
    files: ObservableList,
    stability_retry: Duration,
}

impl SessionHandle {
    pub(crate) fn new(conn: Arc<Connection>, storage_dir: PathBuf, stability_retry: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            conn,
            storage_dir,
            files: ObservableList::new(),
            stability_retry,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Published copy of the session's known files.
    pub fn files(&self) -> &ObservableList {
        &self.files
    }

    /// Wait for `source_dir/name` to settle, then push it to this session's
    /// client as a FileTransfer.
    ///
    /// Takes as long as the client needs to drain the file; only a client
    /// that stops reading altogether fails the send.
    pub async fn send_file(&self, source_dir: &Path, name: &str) -> Result<()> {
        let path = path_in_dir(source_dir, name)?;
        watcher::wait_until_stable(&path, self.stability_retry).await?;
        let contents = storage::read_file(source_dir, name)?;
        self.conn
            .send(&Message::FileTransfer {
                filename: name.to_string(),
                contents,
            })
            .await
    }
}

/// Reader task state for one accepted connection.
pub struct UserSession {
    handle: Arc<SessionHandle>,
    reader: FrameReader,
    registry: Arc<ServerRegistry>,
    username: Option<String>,
    known_files: Vec<String>,
}

impl UserSession {
    pub(crate) fn new(handle: Arc<SessionHandle>, reader: FrameReader, registry: Arc<ServerRegistry>) -> Self {
        Self {
            handle,
            reader,
            registry,
            username: None,
            known_files: Vec::new(),
        }
    }

    /// Dispatch inbound messages until Goodbye or a fatal error, then
    /// unregister and close.
    pub async fn run(mut self) {
        let res = self.dispatch().await;
        let who = self.display_name();
        match &res {
            Ok(()) => info!(user = %who, "session ended"),
            Err(SyncError::Closed) => info!(user = %who, "peer disconnected"),
            Err(e) => {
                warn!(user = %who, error = %e, "session failed");
                self.registry.sink().emit(StatusEvent::Error {
                    context: format!("session {}", who),
                    message: e.to_string(),
                });
            }
        }
        if let Some(user) = self.registry.leave(self.handle.id()).await {
            if res.is_err() {
                self.registry.sink().emit(StatusEvent::Left { user });
            }
        }
        self.handle.conn().shutdown().await;
    }

    fn display_name(&self) -> String {
        match &self.username {
            Some(u) => u.clone(),
            None => self.handle.conn().peer().to_string(),
        }
    }

    async fn dispatch(&mut self) -> Result<()> {
        loop {
            let msg = self.reader.receive_next().await?;
            debug!(user = %self.display_name(), kind = msg.name(), "received");
            match msg {
                Message::Greeting { username } => self.on_greeting(username).await?,
                Message::Goodbye => {
                    if let Some(user) = self.username.clone() {
                        self.registry.sink().emit(StatusEvent::Left { user });
                    }
                    return Ok(());
                }
                Message::FileTransfer { filename, contents } => {
                    self.on_file(&filename, &contents);
                    self.send_files_list().await?;
                }
                Message::DeletedList(names) => {
                    self.on_deleted(&names);
                    self.send_files_list().await?;
                }
                Message::RelayRequest { filename, target } => self.on_relay(filename, target),
                other => {
                    return Err(SyncError::Protocol(format!(
                        "unexpected {} from client",
                        other.name()
                    )))
                }
            }
        }
    }

    async fn on_greeting(&mut self, username: String) -> Result<()> {
        if self.username.is_some() {
            return Err(SyncError::Protocol("second greeting on one session".into()));
        }
        if username.trim().is_empty() {
            return Err(SyncError::Protocol("empty username in greeting".into()));
        }
        self.registry.on_greeting(self.handle.id(), &username).await?;
        info!(user = %username, dir = %self.handle.storage_dir().display(), "joined");
        self.registry.sink().emit(StatusEvent::Joined {
            user: username.clone(),
        });
        self.username = Some(username);
        Ok(())
    }

    fn on_file(&mut self, filename: &str, contents: &[u8]) {
        match storage::save_new_file(self.handle.storage_dir(), filename, contents) {
            Ok(_) => {
                info!(file = %filename, bytes = contents.len(), "saved upload");
                if !self.known_files.iter().any(|f| f == filename) {
                    self.known_files.push(filename.to_string());
                }
                self.registry.sink().emit(StatusEvent::Saved {
                    file: filename.to_string(),
                });
            }
            Err(e) => {
                warn!(file = %filename, error = %e, "upload not saved");
                self.registry.sink().emit(StatusEvent::SaveFailed {
                    file: filename.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_deleted(&mut self, names: &[String]) {
        for name in names {
            match storage::remove_file(self.handle.storage_dir(), name) {
                Ok(()) => self.registry.sink().emit(StatusEvent::Deleted { file: name.clone() }),
                Err(e) => {
                    warn!(file = %name, error = %e, "delete failed");
                    self.registry.sink().emit(StatusEvent::DeleteFailed {
                        file: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.known_files.retain(|f| !names.contains(f));
    }

    async fn send_files_list(&mut self) -> Result<()> {
        self.handle.files().replace(self.known_files.clone());
        self.handle
            .conn()
            .send(&Message::FilesList(self.known_files.clone()))
            .await?;
        self.registry.sink().emit(StatusEvent::FilesListSent {
            to: self.display_name(),
        });
        Ok(())
    }

    /// Hand the file to the target's connection on a separate task so a slow
    /// target never blocks this reader. Bad names and unknown targets are
    /// reported here and otherwise ignored.
    fn on_relay(&self, filename: String, target: String) {
        if let Err(e) = validate_file_name(&filename) {
            warn!(file = %filename, to = %target, error = %e, "relay request rejected");
            self.registry.sink().emit(StatusEvent::RelayRejected {
                file: filename,
                reason: e.to_string(),
            });
            return;
        }
        let Some(dest) = self.registry.resolve(&target) else {
            info!(file = %filename, to = %target, "relay target not online, dropping");
            self.registry.sink().emit(StatusEvent::RelayDropped { file: filename, to: target });
            return;
        };
        let source_dir = self.handle.storage_dir().to_path_buf();
        let sink = self.registry.sink().clone();
        tokio::spawn(async move {
            match dest.send_file(&source_dir, &filename).await {
                Ok(()) => {
                    info!(file = %filename, to = %target, "relayed");
                    sink.emit(StatusEvent::Sent {
                        file: filename,
                        to: Some(target),
                    });
                }
                Err(e) => {
                    warn!(file = %filename, to = %target, error = %e, "relay failed");
                    sink.emit(StatusEvent::Error {
                        context: format!("relaying {} to {}", filename, target),
                        message: e.to_string(),
                    });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ChannelSink, NoopSink};
    use tempfile::TempDir;

    struct Peer {
        conn: Arc<Connection>,
        reader: FrameReader,
    }

    /// Register a session with the registry and start its reader task.
    fn spawn_session(reg: &Arc<ServerRegistry>, dir_name: &str) -> (Arc<SessionHandle>, Peer) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (conn, reader) = Connection::new(ar, aw, dir_name);
        let (peer_conn, peer_reader) = Connection::new(br, bw, "client");
        let dir = reg.root().join(dir_name);
        std::fs::create_dir(&dir).unwrap();
        let handle = Arc::new(SessionHandle::new(conn, dir, Duration::from_millis(5)));
        reg.insert(handle.clone());
        tokio::spawn(UserSession::new(handle.clone(), reader, reg.clone()).run());
        (
            handle,
            Peer {
                conn: peer_conn,
                reader: peer_reader,
            },
        )
    }

    #[tokio::test]
    async fn upload_then_delete_updates_the_files_list() {
        let tmp = TempDir::new().unwrap();
        let reg = ServerRegistry::new(tmp.path(), Duration::from_millis(5), Arc::new(NoopSink)).unwrap();
        let (handle, mut peer) = spawn_session(&reg, "client_0");

        peer.conn
            .send(&Message::Greeting {
                username: "alice".into(),
            })
            .await
            .unwrap();
        assert_eq!(peer.reader.receive_next().await.unwrap(), Message::UsersList(vec![]));

        peer.conn
            .send(&Message::FileTransfer {
                filename: "old.txt".into(),
                contents: b"stale".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(
            peer.reader.receive_next().await.unwrap(),
            Message::FilesList(vec!["old.txt".into()])
        );
        assert_eq!(std::fs::read(handle.storage_dir().join("old.txt")).unwrap(), b"stale");
        assert_eq!(reg.snapshot(), vec![("alice".to_string(), vec!["old.txt".to_string()])]);

        peer.conn
            .send(&Message::DeletedList(vec!["old.txt".into(), "never.txt".into()]))
            .await
            .unwrap();
        assert_eq!(peer.reader.receive_next().await.unwrap(), Message::FilesList(vec![]));
        assert!(!handle.storage_dir().join("old.txt").exists());
    }

    #[tokio::test]
    async fn duplicate_upload_is_refused_but_still_answered() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut events) = ChannelSink::new();
        let reg = ServerRegistry::new(tmp.path(), Duration::from_millis(5), Arc::new(sink)).unwrap();
        let (handle, mut peer) = spawn_session(&reg, "client_0");
        std::fs::write(handle.storage_dir().join("dup.txt"), b"original").unwrap();

        peer.conn
            .send(&Message::FileTransfer {
                filename: "dup.txt".into(),
                contents: b"replacement".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(peer.reader.receive_next().await.unwrap(), Message::FilesList(vec![]));
        assert_eq!(std::fs::read(handle.storage_dir().join("dup.txt")).unwrap(), b"original");

        let mut saw_failure = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, StatusEvent::SaveFailed { ref file, .. } if file == "dup.txt") {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn second_greeting_ends_the_session() {
        let tmp = TempDir::new().unwrap();
        let reg = ServerRegistry::new(tmp.path(), Duration::from_millis(5), Arc::new(NoopSink)).unwrap();
        let (_handle, mut peer) = spawn_session(&reg, "client_0");

        for _ in 0..2 {
            peer.conn
                .send(&Message::Greeting {
                    username: "alice".into(),
                })
                .await
                .unwrap();
        }
        assert_eq!(peer.reader.receive_next().await.unwrap(), Message::UsersList(vec![]));
        assert!(matches!(peer.reader.receive_next().await, Err(SyncError::Closed)));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn relay_reads_from_the_senders_directory() {
        let tmp = TempDir::new().unwrap();
        let reg = ServerRegistry::new(tmp.path(), Duration::from_millis(5), Arc::new(NoopSink)).unwrap();
        let (alice, mut a) = spawn_session(&reg, "client_0");
        let (_bob, mut b) = spawn_session(&reg, "client_1");
        std::fs::write(alice.storage_dir().join("report.txt"), b"q3 numbers").unwrap();

        a.conn
            .send(&Message::Greeting {
                username: "alice".into(),
            })
            .await
            .unwrap();
        assert_eq!(a.reader.receive_next().await.unwrap(), Message::UsersList(vec![]));
        b.conn
            .send(&Message::Greeting { username: "bob".into() })
            .await
            .unwrap();
        assert_eq!(
            a.reader.receive_next().await.unwrap(),
            Message::UsersList(vec!["bob".into()])
        );
        assert_eq!(
            b.reader.receive_next().await.unwrap(),
            Message::UsersList(vec!["alice".into()])
        );

        a.conn
            .send(&Message::RelayRequest {
                filename: "report.txt".into(),
                target: "bob".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            b.reader.receive_next().await.unwrap(),
            Message::FileTransfer {
                filename: "report.txt".into(),
                contents: b"q3 numbers".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn relay_with_path_separator_is_rejected_and_session_continues() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut events) = ChannelSink::new();
        let reg = ServerRegistry::new(tmp.path(), Duration::from_millis(5), Arc::new(sink)).unwrap();
        let (handle, mut peer) = spawn_session(&reg, "client_0");
        peer.conn
            .send(&Message::RelayRequest {
                filename: "../client_1/secret".into(),
                target: "bob".into(),
            })
            .await
            .unwrap();

        // Same connection still serves uploads
        peer.conn
            .send(&Message::FileTransfer {
                filename: "after.txt".into(),
                contents: b"ok".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(
            peer.reader.receive_next().await.unwrap(),
            Message::FilesList(vec!["after.txt".into()])
        );
        assert!(handle.storage_dir().join("after.txt").exists());
        assert_eq!(reg.len(), 1);

        let mut rejected = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, StatusEvent::RelayRejected { ref file, .. } if file == "../client_1/secret") {
                rejected = true;
            }
        }
        assert!(rejected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_to_a_slow_reader_completes() {
        use tokio::io::AsyncReadExt;

        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("client_0");
        std::fs::create_dir(&source).unwrap();
        let big: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(source.join("big.bin"), &big).unwrap();

        let (a, mut b) = tokio::io::duplex(8 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (conn, _r) = Connection::with_stall_timeout(ar, aw, "slow", Duration::from_millis(300));
        let target = SessionHandle::new(conn, tmp.path().join("client_1"), Duration::from_millis(5));

        // 8 KiB per 20ms: the whole file takes several stall windows
        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            let mut buf = vec![0u8; 16 * 1024];
            while got.len() < big.len() {
                tokio::time::sleep(Duration::from_millis(20)).await;
                match b.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => got.extend_from_slice(&buf[..n]),
                }
            }
            got
        });

        let started = std::time::Instant::now();
        target.send_file(&source, "big.bin").await.unwrap();
        assert!(started.elapsed() > Duration::from_millis(600));
        assert!(!target.conn().is_closed());
        assert!(drain.await.unwrap().len() >= 1024 * 1024);
    }
}
