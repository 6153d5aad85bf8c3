//! In-memory [`FileIndex`] with the same ordering rules as the SQLite backend.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{FileIndex, FileRecord, Generation, IndexError, ScanOrder};
use crate::scanner::Digest;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<OsString, (u64, Option<Digest>)>,
    generation: Option<Generation>,
    digest_writes: u64,
}

/// Volatile index for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

impl MemoryIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a single record.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<FileRecord> {
        self.lock()
            .records
            .get(path.as_os_str())
            .map(|(size, digest)| FileRecord {
                path: path.to_path_buf(),
                size: *size,
                digest: digest.clone(),
            })
    }

    /// How many times [`FileIndex::update_digest`] has been called.
    #[must_use]
    pub fn digest_writes(&self) -> u64 {
        self.lock().digest_writes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn size_key(a: &FileRecord, b: &FileRecord) -> Ordering {
    a.size
        .cmp(&b.size)
        .then_with(|| a.path.as_os_str().cmp(b.path.as_os_str()))
}

fn digest_str(record: &FileRecord) -> &str {
    record.digest.as_ref().map_or("", Digest::as_str)
}

fn digest_key(a: &FileRecord, b: &FileRecord) -> Ordering {
    digest_str(a)
        .cmp(digest_str(b))
        .then_with(|| a.path.as_os_str().cmp(b.path.as_os_str()))
}

impl FileIndex for MemoryIndex {
    fn insert(&self, path: &Path, size: u64) -> Result<bool, IndexError> {
        let mut state = self.lock();
        if state.records.contains_key(path.as_os_str()) {
            return Ok(false);
        }
        state
            .records
            .insert(path.as_os_str().to_os_string(), (size, None));
        Ok(true)
    }

    fn fetch_page(
        &self,
        order: ScanOrder,
        after: Option<&FileRecord>,
        limit: usize,
    ) -> Result<Vec<FileRecord>, IndexError> {
        let state = self.lock();
        let compare: fn(&FileRecord, &FileRecord) -> Ordering = match order {
            ScanOrder::BySize => size_key,
            ScanOrder::ByDigest => digest_key,
        };

        let mut page: Vec<FileRecord> = state
            .records
            .iter()
            .map(|(path, (size, digest))| FileRecord {
                path: PathBuf::from(OsStr::new(path)),
                size: *size,
                digest: digest.clone(),
            })
            .filter(|r| match order {
                ScanOrder::BySize => true,
                ScanOrder::ByDigest => matches!(r.digest, Some(Digest::Value(_))),
            })
            .filter(|r| after.is_none_or(|a| compare(r, a) == Ordering::Greater))
            .collect();
        page.sort_by(compare);
        page.truncate(limit);
        Ok(page)
    }

    fn update_digest(&self, path: &Path, digest: &Digest) -> Result<(), IndexError> {
        let mut state = self.lock();
        if let Some(entry) = state.records.get_mut(path.as_os_str()) {
            entry.1 = Some(digest.clone());
        }
        state.digest_writes += 1;
        Ok(())
    }

    fn count(&self) -> Result<u64, IndexError> {
        Ok(self.lock().records.len() as u64)
    }

    fn count_digested(&self) -> Result<u64, IndexError> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|(_, d)| matches!(d, Some(Digest::Value(_))))
            .count() as u64)
    }

    fn generation(&self) -> Result<Option<Generation>, IndexError> {
        Ok(self.lock().generation.clone())
    }

    fn reset(&self) -> Result<(), IndexError> {
        let mut state = self.lock();
        state.records.clear();
        state.generation = None;
        Ok(())
    }

    fn complete_generation(&self, generation: &Generation) -> Result<(), IndexError> {
        self.lock().generation = Some(generation.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), IndexError> {
        Ok(())
    }
}
