//! Filesystem capability injected into the pipeline.
//!
//! # Overview
//!
//! The comparator and resolver never touch `std::fs` directly. Every read,
//! size lookup and deletion goes through a [`FileStore`]:
//!
//! - [`OsFileStore`]: the real filesystem, deleting permanently or moving
//!   files to the system trash
//! - [`MemoryFileStore`]: an in-memory double used by tests and benchmarks
//!
//! Directory traversal is not part of the store; the indexer walks the real
//! tree with [`crate::scanner::Walker`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Read, stat and delete operations used by the fingerprint functions and
/// the resolver.
pub trait FileStore: Send + Sync {
    /// Open a file for sequential reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>>;

    /// Current size of a file in bytes.
    fn stat(&self, path: &Path) -> io::Result<u64>;

    /// Remove a file.
    fn delete(&self, path: &Path) -> io::Result<()>;
}

/// How [`OsFileStore`] removes files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    /// Unlink the file.
    #[default]
    Permanent,
    /// Move the file to the platform recycle bin.
    Trash,
}

/// [`FileStore`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileStore {
    mode: DeleteMode,
}

impl OsFileStore {
    /// Create a store that deletes with the given mode.
    #[must_use]
    pub fn new(mode: DeleteMode) -> Self {
        Self { mode }
    }

    /// The configured delete mode.
    #[must_use]
    pub fn mode(&self) -> DeleteMode {
        self.mode
    }
}

impl FileStore for OsFileStore {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(path)?))
    }

    fn stat(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match self.mode {
            DeleteMode::Permanent => fs::remove_file(path),
            DeleteMode::Trash => {
                // trash reports success for some missing paths, so check first
                if !path.exists() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} no longer exists", path.display()),
                    ));
                }
                trash::delete(path).map_err(|e| io::Error::other(e.to_string()))
            }
        }
    }
}

/// In-memory [`FileStore`].
///
/// Paths are plain keys; no directory structure is modelled.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    /// Paths whose deletion fails with `PermissionDenied`.
    locked: Mutex<Vec<PathBuf>>,
}

impl MemoryFileStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.lock_files().insert(path.into(), contents.into());
    }

    /// Remove a file without going through [`FileStore::delete`].
    pub fn remove(&self, path: &Path) {
        self.lock_files().remove(path);
    }

    /// Make every later deletion of `path` fail.
    pub fn lock(&self, path: impl Into<PathBuf>) {
        self.locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.into());
    }

    /// Whether the store currently holds `path`.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.lock_files().contains_key(path)
    }

    /// All stored paths in ascending order.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock_files().keys().cloned().collect()
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn missing(path: &Path) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not in store", path.display()),
        )
    }
}

impl FileStore for MemoryFileStore {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        let contents = self
            .lock_files()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::missing(path))?;
        Ok(Box::new(Cursor::new(contents)))
    }

    fn stat(&self, path: &Path) -> io::Result<u64> {
        self.lock_files()
            .get(path)
            .map(|c| c.len() as u64)
            .ok_or_else(|| Self::missing(path))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        let locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        if locked.iter().any(|p| p == path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is locked", path.display()),
            ));
        }
        drop(locked);

        self.lock_files()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::missing(path))
    }
}
