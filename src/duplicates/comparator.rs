//! Phase 2: short digests for size collisions.
//!
//! # Overview
//!
//! The index is streamed in `(size, path)` order. A record is hashed only
//! when its size equals the size of the record before it, and the earlier
//! record of the pair is hashed too if it still has no digest. A file whose
//! size is unique in the index is therefore never read.
//!
//! Records that already carry a digest are never hashed again, so running
//! the phase over a partially digested index finishes the work of an
//! interrupted run and is a no-op on a complete one.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::PipelineError;
use crate::index::{FileIndex, FileRecord, Scan, ScanOrder, DEFAULT_PAGE_SIZE};
use crate::progress::{ProgressCallback, PHASE_COMPARING};
use crate::scanner::{Digest, Fingerprinter};
use crate::store::FileStore;

/// Counters from the size comparator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompareStats {
    /// Records streamed.
    pub records: u64,
    /// Short digests computed and stored by this run.
    pub hashed: u64,
    /// Digests that came back as `NotFound`.
    pub vanished: u64,
}

/// The record before the current one in size order.
#[derive(Debug)]
struct Previous {
    size: u64,
    path: PathBuf,
    digest: Option<Digest>,
}

impl From<FileRecord> for Previous {
    fn from(record: FileRecord) -> Self {
        Self {
            size: record.size,
            path: record.path,
            digest: record.digest,
        }
    }
}

/// Fold state threaded through the scan.
#[derive(Debug, Default)]
struct Fold {
    previous: Option<Previous>,
    stats: CompareStats,
}

/// Assigns short digests to every record whose size collides.
pub struct SizeComparator<'a> {
    index: &'a dyn FileIndex,
    store: &'a dyn FileStore,
    fingerprinter: &'a dyn Fingerprinter,
    page_size: usize,
    progress: Option<Arc<dyn ProgressCallback>>,
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl<'a> SizeComparator<'a> {
    /// Create a comparator over `index`.
    #[must_use]
    pub fn new(
        index: &'a dyn FileIndex,
        store: &'a dyn FileStore,
        fingerprinter: &'a dyn Fingerprinter,
    ) -> Self {
        Self {
            index,
            store,
            fingerprinter,
            page_size: DEFAULT_PAGE_SIZE,
            progress: None,
            shutdown_flag: None,
        }
    }

    /// Rows fetched per index page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the progress callback.
    #[must_use]
    pub fn with_progress_callback(mut self, callback: Option<Arc<dyn ProgressCallback>>) -> Self {
        self.progress = callback;
        self
    }

    /// Set the shutdown flag for graceful termination.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Option<Arc<AtomicBool>>) -> Self {
        self.shutdown_flag = flag;
        self
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Stream the whole index once.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Index`] on index failure, [`PipelineError::Interrupted`]
    /// when the shutdown flag is raised. Pending writes are flushed in both
    /// the success and the interrupted case.
    pub fn run(&self) -> Result<CompareStats, PipelineError> {
        if let Some(progress) = &self.progress {
            progress.on_phase_start(PHASE_COMPARING, self.index.count()?);
        }

        let folded = Scan::new(self.index, ScanOrder::BySize, self.page_size).try_fold(
            Fold::default(),
            |fold, record| {
                if self.is_shutdown_requested() {
                    return Err(PipelineError::Interrupted);
                }
                self.step(fold, record?)
            },
        );
        self.index.flush()?;
        let Fold { stats, .. } = folded?;

        if let Some(progress) = &self.progress {
            progress.on_phase_end(PHASE_COMPARING);
        }
        log::info!(
            "Compared {} files, computed {} short digests ({} vanished)",
            stats.records,
            stats.hashed,
            stats.vanished
        );
        Ok(stats)
    }

    fn step(&self, mut fold: Fold, record: FileRecord) -> Result<Fold, PipelineError> {
        let mut current = Previous::from(record);

        if let Some(previous) = fold.previous.as_mut() {
            if previous.size == current.size {
                if previous.digest.is_none() {
                    previous.digest = Some(self.hash(previous, &mut fold.stats)?);
                }
                if current.digest.is_none() {
                    current.digest = Some(self.hash(&current, &mut fold.stats)?);
                }
            } else {
                log::trace!("Unique size so far: {}", current.path.display());
            }
        }

        fold.stats.records += 1;
        if let Some(progress) = &self.progress {
            progress.on_progress(fold.stats.records, &current.path.to_string_lossy());
        }
        fold.previous = Some(current);
        Ok(fold)
    }

    fn hash(&self, record: &Previous, stats: &mut CompareStats) -> Result<Digest, PipelineError> {
        let digest = self.fingerprinter.short_digest(self.store, &record.path);
        self.index.update_digest(&record.path, &digest)?;
        stats.hashed += 1;
        if digest.is_not_found() {
            stats.vanished += 1;
        }
        log::trace!(
            "Short digest {} for {} ({} bytes)",
            digest,
            record.path.display(),
            record.size
        );
        Ok(digest)
    }
}
