//! Error kinds shared by the client and server halves

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by sessions, the wire codec and the storage helpers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The socket to the server could not be established
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure on an established connection
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),

    /// Malformed frame (unknown tag, bad length, invalid UTF-8)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed locally or by the peer
    #[error("connection closed")]
    Closed,

    /// Watched or storage directory missing or inaccessible
    #[error("path error: {}: {reason}", path.display())]
    Path { path: PathBuf, reason: String },

    /// Server-side storage directory could not be allocated
    #[error("could not allocate storage directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Incoming file collides with an existing local file
    #[error("refusing to overwrite existing file {0:?}")]
    SaveConflict(String),

    /// File name is not a single plain path component
    #[error("invalid file name {0:?}")]
    InvalidName(String),

    /// Another live session already greeted with this username
    #[error("username {0:?} is already online")]
    UsernameTaken(String),

    /// Outgoing value exceeds a wire limit; nothing was written
    #[error("{what} too large: {size} (max: {max})")]
    TooLarge { what: String, size: u64, max: u64 },

    /// Username/folder precheck failed before a session was started
    #[error("invalid credentials: {0}")]
    Credentials(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub(crate) fn path(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SyncError::Path {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the error means the connection itself is unusable.
    ///
    /// Protocol errors count: the framing has no resynchronization point.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SyncError::Stream(_) | SyncError::Protocol(_) | SyncError::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_classified() {
        assert!(SyncError::Closed.is_connection_error());
        assert!(SyncError::Protocol("bad tag".into()).is_connection_error());
        assert!(SyncError::Stream(io::Error::from(io::ErrorKind::BrokenPipe)).is_connection_error());
        assert!(!SyncError::SaveConflict("a.txt".into()).is_connection_error());
        assert!(!SyncError::InvalidName("../a".into()).is_connection_error());
        assert!(!SyncError::path("/nope", "missing").is_connection_error());
        let big = SyncError::TooLarge {
            what: "file big.iso".into(),
            size: 300,
            max: 256,
        };
        assert!(!big.is_connection_error());
    }

    #[test]
    fn messages_name_the_subject() {
        let e = SyncError::SaveConflict("report.txt".into());
        assert!(e.to_string().contains("report.txt"));
        let e = SyncError::path("/data/cloud", "does not exist");
        assert_eq!(e.to_string(), "path error: /data/cloud: does not exist");
    }
}
