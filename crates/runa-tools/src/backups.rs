// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-file backup store with LRU eviction.
//!
//! Every destructive file operation (overwrite, edit, delete) snapshots the
//! previous content here before touching disk, and `undo_edit` restores the
//! most recent snapshot.  A backup lives until undo consumes it or the LRU
//! cap evicts its path.  The single store lock doubles as the per-path lock:
//! two backups of the same file cannot race.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;

/// Snapshots kept per path.
const PER_PATH_DEPTH: usize = 8;
/// Paths tracked before the least-recently-touched one is evicted.
const PATH_CAP: usize = 64;

/// Pre-operation snapshot of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    /// The file existed with this content.
    Content(Vec<u8>),
    /// The file did not exist before the operation.
    Absent,
}

pub struct BackupStore {
    inner: Mutex<LruCache<PathBuf, Vec<Snapshot>>>,
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(PATH_CAP).expect("nonzero cap"),
            )),
        }
    }

    /// Snapshot the current on-disk state of `path`.
    pub fn backup(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = match std::fs::read(path) {
            Ok(bytes) => Snapshot::Content(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::Absent,
            Err(e) => return Err(e),
        };
        let mut inner = self.inner.lock().unwrap();
        let stack = inner.get_or_insert_mut(path.to_path_buf(), Vec::new);
        stack.push(snapshot);
        if stack.len() > PER_PATH_DEPTH {
            stack.remove(0);
        }
        Ok(())
    }

    /// Restore the most recent snapshot of `path`.
    ///
    /// Returns `Ok(true)` when a snapshot was applied, `Ok(false)` when no
    /// backup exists for the path.  Restoring an `Absent` snapshot deletes
    /// the file (the pre-write state of a newly created file is "not there").
    pub fn undo(&self, path: &Path) -> std::io::Result<bool> {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            match inner.get_mut(path) {
                Some(stack) => stack.pop(),
                None => None,
            }
        };
        match snapshot {
            None => Ok(false),
            Some(Snapshot::Content(bytes)) => {
                std::fs::write(path, bytes)?;
                Ok(true)
            }
            Some(Snapshot::Absent) => {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                Ok(true)
            }
        }
    }

    /// Whether any snapshot is held for `path`.
    pub fn has_backup(&self, path: &Path) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.get(path).map(|s| !s.is_empty()).unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
