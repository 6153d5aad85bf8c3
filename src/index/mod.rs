//! Persistent file index.
//!
//! This module provides the durable table of discovered files that the
//! pipeline stages read and update in place, so an interrupted run can be
//! resumed without re-indexing or re-hashing.
//!
//! # Architecture
//!
//! * [`FileIndex`]: the storage-agnostic interface (insert, keyset-paged
//!   ordered fetch, keyed digest update, generation metadata).
//! * [`sqlite`]: the SQLite backend used by the binary.
//! * [`memory`]: an in-memory backend with identical ordering semantics.
//! * [`Scan`]: a lazy, restartable iterator over an index in a given order,
//!   fetching one page at a time so memory stays bounded.
//!
//! # Generations
//!
//! An index holds one generation of records. A generation is recorded as
//! complete only after the indexer has walked the whole tree; reuse without
//! re-indexing requires a complete generation.

pub mod memory;
pub mod sqlite;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scanner::Digest;

pub use memory::MemoryIndex;
pub use sqlite::{SqliteIndex, DEFAULT_WRITE_BATCH};

/// Default number of rows fetched per scan page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// One regular file discovered during indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute path, unique within a generation.
    pub path: PathBuf,
    /// Byte length captured at index time.
    pub size: u64,
    /// Short digest or `NotFound`; `None` until the size collides.
    pub digest: Option<Digest>,
}

impl FileRecord {
    /// Create an undigested record.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            digest: None,
        }
    }

    /// Attach a digest.
    #[must_use]
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }
}

/// Metadata of a completed indexing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Root directory that was walked.
    pub root: PathBuf,
    /// Number of records inserted.
    pub files: u64,
    /// When indexing finished.
    pub indexed_at: DateTime<Utc>,
}

impl Generation {
    /// Describe a generation finishing now.
    #[must_use]
    pub fn completed_now(root: &Path, files: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            files,
            indexed_at: Utc::now(),
        }
    }
}

/// Scan order over the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Every record, ordered by `(size, path)`.
    BySize,
    /// Records with a real digest (not empty, not `NotFound`), ordered by
    /// `(digest, path)`.
    ByDigest,
}

/// Errors raised by index backends.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// The SQLite backend failed.
    #[error("index database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The path cannot be stored as text.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// The size does not fit the storage column.
    #[error("file size {0} is out of range for the index")]
    SizeOutOfRange(u64),

    /// A stored row could not be decoded.
    #[error("corrupt index row: {0}")]
    Corrupt(String),
}

/// Ordered, updatable table of [`FileRecord`]s.
///
/// Paths compare byte-wise (the SQLite `BINARY` collation), which is also how
/// [`std::ffi::OsStr`] orders on Unix.
pub trait FileIndex {
    /// Insert an undigested record. Returns `false` when the path is already
    /// present, leaving the existing record unchanged.
    fn insert(&self, path: &Path, size: u64) -> Result<bool, IndexError>;

    /// Fetch up to `limit` records in `order` strictly after `after`.
    fn fetch_page(
        &self,
        order: ScanOrder,
        after: Option<&FileRecord>,
        limit: usize,
    ) -> Result<Vec<FileRecord>, IndexError>;

    /// Set the digest of the record at `path`.
    fn update_digest(&self, path: &Path, digest: &Digest) -> Result<(), IndexError>;

    /// Total number of records.
    fn count(&self) -> Result<u64, IndexError>;

    /// Number of records visited by a [`ScanOrder::ByDigest`] scan.
    fn count_digested(&self) -> Result<u64, IndexError>;

    /// The completed generation, if any.
    fn generation(&self) -> Result<Option<Generation>, IndexError>;

    /// Discard all records and generation metadata.
    fn reset(&self) -> Result<(), IndexError>;

    /// Record a completed generation.
    fn complete_generation(&self, generation: &Generation) -> Result<(), IndexError>;

    /// Make pending writes durable.
    fn flush(&self) -> Result<(), IndexError>;
}

/// Lazy keyset-paged iterator over a [`FileIndex`].
///
/// Each page is fetched with the last record of the previous page as the
/// cursor, so updates to the digest column during a [`ScanOrder::BySize`]
/// scan never disturb the iteration.
pub struct Scan<'a> {
    index: &'a dyn FileIndex,
    order: ScanOrder,
    page_size: usize,
    page: std::vec::IntoIter<FileRecord>,
    cursor: Option<FileRecord>,
    exhausted: bool,
}

impl<'a> Scan<'a> {
    /// Start a scan from the beginning of `order`.
    #[must_use]
    pub fn new(index: &'a dyn FileIndex, order: ScanOrder, page_size: usize) -> Self {
        Self {
            index,
            order,
            page_size: page_size.max(1),
            page: Vec::new().into_iter(),
            cursor: None,
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<(), IndexError> {
        let page = self
            .index
            .fetch_page(self.order, self.cursor.as_ref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        log::trace!("Fetched index page of {} records", page.len());
        self.page = page.into_iter();
        Ok(())
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<FileRecord, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.page.next() {
                self.cursor = Some(record.clone());
                return Some(Ok(record));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}
