//! SQLite-backed file index.
//!
//! Schema (version 1):
//!
//! ```sql
//! file (path TEXT PRIMARY KEY, hash TEXT NOT NULL DEFAULT '', size INTEGER NOT NULL)
//! generation (id INTEGER PRIMARY KEY CHECK (id = 1), root TEXT, files INTEGER, indexed_at TEXT)
//! ```
//!
//! Writes are grouped into transactions of `write_batch` statements. Reads
//! issued while a transaction is open see its uncommitted rows.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{FileIndex, FileRecord, Generation, IndexError, ScanOrder};
use crate::scanner::{Digest, NOT_FOUND};

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Default number of writes per transaction.
pub const DEFAULT_WRITE_BATCH: usize = 500;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS file (
        path TEXT PRIMARY KEY NOT NULL,
        hash TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS file_size_path ON file (size, path);
    CREATE INDEX IF NOT EXISTS file_hash_path ON file (hash, path);
    CREATE TABLE IF NOT EXISTS generation (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        root TEXT NOT NULL,
        files INTEGER NOT NULL,
        indexed_at TEXT NOT NULL
    );
";

/// Persistent [`FileIndex`] stored in a SQLite database file.
pub struct SqliteIndex {
    conn: Connection,
    location: Option<PathBuf>,
    write_batch: usize,
    pending: Cell<usize>,
}

impl std::fmt::Debug for SqliteIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteIndex")
            .field("location", &self.location)
            .field("write_batch", &self.write_batch)
            .field("pending", &self.pending.get())
            .finish_non_exhaustive()
    }
}

impl SqliteIndex {
    /// Open or create the index database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Sqlite`] if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!(
                    "Failed to create index directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        log::trace!("Index journal mode: {}", mode);
        let index = Self::from_connection(conn, Some(path.to_path_buf()))?;
        log::debug!("Opened file index at {}", path.display());
        Ok(index)
    }

    /// Open a throwaway in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Sqlite`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, location: Option<PathBuf>) -> Result<Self, IndexError> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(IndexError::Corrupt(format!(
                "schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;

        Ok(Self {
            conn,
            location,
            write_batch: DEFAULT_WRITE_BATCH,
            pending: Cell::new(0),
        })
    }

    /// Set how many writes are grouped into one transaction.
    #[must_use]
    pub fn with_write_batch(mut self, write_batch: usize) -> Self {
        self.write_batch = write_batch.max(1);
        self
    }

    /// Database file, if not in memory.
    #[must_use]
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Count one write, opening a transaction before it and committing once
    /// the batch is full.
    fn write<T>(&self, op: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, IndexError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        let result = op(&self.conn)?;
        self.pending.set(self.pending.get() + 1);
        if self.pending.get() >= self.write_batch {
            self.commit()?;
        }
        Ok(result)
    }

    fn commit(&self) -> Result<(), IndexError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
            log::trace!("Committed {} index writes", self.pending.get());
        }
        self.pending.set(0);
        Ok(())
    }

    fn read_record(row: &Row<'_>) -> rusqlite::Result<(String, i64, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }
}

fn path_text(path: &Path) -> Result<&str, IndexError> {
    path.to_str()
        .ok_or_else(|| IndexError::NonUtf8Path(path.to_path_buf()))
}

fn size_value(size: u64) -> Result<i64, IndexError> {
    i64::try_from(size).map_err(|_| IndexError::SizeOutOfRange(size))
}

fn decode((path, size, hash): (String, i64, String)) -> Result<FileRecord, IndexError> {
    let size = u64::try_from(size)
        .map_err(|_| IndexError::Corrupt(format!("negative size {size} for {path}")))?;
    Ok(FileRecord {
        path: PathBuf::from(path),
        size,
        digest: Digest::from_stored(&hash),
    })
}

impl FileIndex for SqliteIndex {
    fn insert(&self, path: &Path, size: u64) -> Result<bool, IndexError> {
        let text = path_text(path)?;
        let size = size_value(size)?;
        let changed = self.write(|conn| {
            conn.prepare_cached("INSERT OR IGNORE INTO file (path, size) VALUES (?1, ?2)")?
                .execute(params![text, size])
        })?;
        Ok(changed == 1)
    }

    fn fetch_page(
        &self,
        order: ScanOrder,
        after: Option<&FileRecord>,
        limit: usize,
    ) -> Result<Vec<FileRecord>, IndexError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, i64, String)> = match (order, after) {
            (ScanOrder::BySize, None) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT path, size, hash FROM file ORDER BY size, path LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], Self::read_record)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            (ScanOrder::BySize, Some(last)) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT path, size, hash FROM file
                     WHERE size > ?1 OR (size = ?1 AND path > ?2)
                     ORDER BY size, path LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![size_value(last.size)?, path_text(&last.path)?, limit],
                    Self::read_record,
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            (ScanOrder::ByDigest, None) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT path, size, hash FROM file
                     WHERE hash <> '' AND hash <> ?1
                     ORDER BY hash, path LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![NOT_FOUND, limit], Self::read_record)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            (ScanOrder::ByDigest, Some(last)) => {
                let hash = last.digest.as_ref().map_or("", Digest::as_str);
                let mut stmt = self.conn.prepare_cached(
                    "SELECT path, size, hash FROM file
                     WHERE hash <> '' AND hash <> ?1
                       AND (hash > ?2 OR (hash = ?2 AND path > ?3))
                     ORDER BY hash, path LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![NOT_FOUND, hash, path_text(&last.path)?, limit],
                    Self::read_record,
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        rows.into_iter().map(decode).collect()
    }

    fn update_digest(&self, path: &Path, digest: &Digest) -> Result<(), IndexError> {
        let text = path_text(path)?;
        self.write(|conn| {
            conn.prepare_cached("UPDATE file SET hash = ?1 WHERE path = ?2")?
                .execute(params![digest.as_str(), text])
        })?;
        Ok(())
    }

    fn count(&self) -> Result<u64, IndexError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM file", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn count_digested(&self) -> Result<u64, IndexError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM file WHERE hash <> '' AND hash <> ?1",
            params![NOT_FOUND],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn generation(&self) -> Result<Option<Generation>, IndexError> {
        let row: Option<(String, i64, String)> = self
            .conn
            .query_row(
                "SELECT root, files, indexed_at FROM generation WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(root, files, indexed_at)| {
            let indexed_at = DateTime::parse_from_rfc3339(&indexed_at)
                .map_err(|e| IndexError::Corrupt(format!("bad generation timestamp: {e}")))?
                .with_timezone(&Utc);
            Ok(Generation {
                root: PathBuf::from(root),
                files: files.max(0) as u64,
                indexed_at,
            })
        })
        .transpose()
    }

    fn reset(&self) -> Result<(), IndexError> {
        self.commit()?;
        self.conn
            .execute_batch("BEGIN; DELETE FROM file; DELETE FROM generation; COMMIT;")?;
        log::debug!("Index reset");
        Ok(())
    }

    fn complete_generation(&self, generation: &Generation) -> Result<(), IndexError> {
        self.commit()?;
        let files = i64::try_from(generation.files).unwrap_or(i64::MAX);
        self.conn.execute(
            "INSERT OR REPLACE INTO generation (id, root, files, indexed_at) VALUES (1, ?1, ?2, ?3)",
            params![
                path_text(&generation.root)?,
                files,
                generation.indexed_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn flush(&self) -> Result<(), IndexError> {
        self.commit()
    }
}

impl Drop for SqliteIndex {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            log::error!("Failed to commit pending index writes: {}", e);
        }
    }
}
