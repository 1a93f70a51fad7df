//! Whole-file helpers and server storage allocation

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::protocol::MAX_FILE_SIZE;
use crate::protocol_core::path_in_dir;

/// Prefix of per-session storage directories under the server root
pub const CLIENT_DIR_PREFIX: &str = "client_";

/// Read a whole file named by a wire file name.
///
/// Files over the FileTransfer limit are refused with `TooLarge` before
/// anything is read.
pub fn read_file(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = path_in_dir(dir, name)?;
    let len = fs::metadata(&path).map_err(|e| SyncError::path(&path, e))?.len();
    if len > MAX_FILE_SIZE as u64 {
        return Err(SyncError::TooLarge {
            what: format!("file {}", name),
            size: len,
            max: MAX_FILE_SIZE as u64,
        });
    }
    fs::read(&path).map_err(|e| SyncError::path(path, e))
}

/// Write `contents` as a new file. Never overwrites: an existing file of the
/// same name yields `SaveConflict` and is left untouched.
pub fn save_new_file(dir: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
    let path = path_in_dir(dir, name)?;
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(SyncError::SaveConflict(name.to_string()))
        }
        Err(e) => return Err(SyncError::path(path, e)),
    };
    if let Err(e) = file.write_all(contents).and_then(|_| file.flush()) {
        // Do not leave a truncated file that would block the next attempt
        drop(file);
        let _ = fs::remove_file(&path);
        return Err(SyncError::path(path, e));
    }
    Ok(path)
}

pub fn remove_file(dir: &Path, name: &str) -> Result<()> {
    let path = path_in_dir(dir, name)?;
    fs::remove_file(&path).map_err(|e| SyncError::path(path, e))
}

/// Create the first free `client_<n>` directory under `root`.
///
/// Creation is exclusive (`create_dir` fails if the name exists), so two
/// concurrent allocations never share a directory. A loser of that race
/// moves on to the next index.
pub fn allocate_client_dir(root: &Path) -> Result<(u32, PathBuf)> {
    let mut id: u32 = 0;
    loop {
        let path = root.join(format!("{}{}", CLIENT_DIR_PREFIX, id));
        if !path.exists() {
            match fs::create_dir(&path) {
                Ok(()) => return Ok((id, path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(SyncError::Directory { path, source: e }),
            }
        }
        id = id.checked_add(1).ok_or_else(|| SyncError::Directory {
            path: root.to_path_buf(),
            source: std::io::Error::new(ErrorKind::Other, "client directory ids exhausted"),
        })?;
    }
}
