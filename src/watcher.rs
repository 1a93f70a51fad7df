//! Folder polling and snapshot diffing
//!
//! A snapshot is the flat set of regular file names directly inside a
//! folder. Subdirectories are ignored entirely.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use crate::error::{Result, SyncError};

/// File names observed in a watched directory at one poll.
pub type FileSnapshot = BTreeSet<String>;

/// Changes between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: FileSnapshot,
    pub removed: FileSnapshot,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// List the regular files directly inside `dir`.
pub fn poll(dir: &Path) -> Result<FileSnapshot> {
    if !dir.is_dir() {
        return Err(SyncError::path(dir, "not an existing directory"));
    }
    let mut snapshot = FileSnapshot::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.map_err(|e| SyncError::path(dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        // Names that cannot travel as UTF-8 are skipped rather than mangled
        if let Some(name) = entry.file_name().to_str() {
            snapshot.insert(name.to_string());
        }
    }
    Ok(snapshot)
}

/// `added = new - old`, `removed = old - new`.
pub fn diff(old: &FileSnapshot, new: &FileSnapshot) -> Delta {
    Delta {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
    }
}

/// Poll-and-diff loop state for one folder.
pub struct FolderWatcher {
    dir: PathBuf,
    interval: Duration,
    snapshot: FileSnapshot,
}

impl FolderWatcher {
    /// Starts from an empty baseline, so the first cycle reports every file
    /// already present as added.
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            snapshot: FileSnapshot::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> &FileSnapshot {
        &self.snapshot
    }

    /// Poll once, adopt the result as the new baseline and return the delta.
    pub fn cycle(&mut self) -> Result<Delta> {
        let current = poll(&self.dir)?;
        let delta = diff(&self.snapshot, &current);
        self.snapshot = current;
        Ok(delta)
    }

    /// Sleep one interval, then [`cycle`](Self::cycle).
    pub async fn next_delta(&mut self) -> Result<Delta> {
        tokio::time::sleep(self.interval).await;
        self.cycle()
    }
}

fn file_signature(path: &Path) -> std::io::Result<(u64, Option<SystemTime>)> {
    std::fs::rename(path, path)?;
    let file = std::fs::File::open(path)?;
    let md = file.metadata()?;
    Ok((md.len(), md.modified().ok()))
}

/// Wait until `path` looks finished: it can be renamed in place and opened,
/// and its size and mtime did not move over one retry delay.
///
/// Retries without bound while the file is busy. Fails only if the file
/// disappears.
pub async fn wait_until_stable(path: &Path, retry: Duration) -> Result<()> {
    let mut last = None;
    loop {
        match file_signature(path) {
            Ok(sample) => {
                if last == Some(sample) {
                    return Ok(());
                }
                last = Some(sample);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::path(path, "file vanished before it settled"));
            }
            Err(_) => last = None,
        }
        tokio::time::sleep(retry).await;
    }
}
