//! Phase 1: populate the file index from a directory walk.
//!
//! A completed generation already in the index is reused unless a reset is
//! requested. Otherwise the index is cleared and every regular file the
//! [`Walker`] yields is inserted with its size and no digest.
//!
//! Entries the walker cannot read are skipped: they are logged, counted in
//! [`IndexStats::errors`] and the walk continues.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::PipelineError;
use crate::index::{FileIndex, Generation};
use crate::progress::{ProgressCallback, PHASE_INDEXING};
use crate::scanner::{Walker, WalkerConfig};

/// Counters from a fresh indexing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Records inserted.
    pub files_indexed: u64,
    /// Paths the walker yielded twice (already present in the index).
    pub duplicate_paths: u64,
    /// Entries skipped because they could not be read or stored.
    pub errors: u64,
}

/// What the indexing phase did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// An existing generation was reused without walking.
    Reused(Generation),
    /// The tree was walked into a fresh generation.
    Built {
        /// The generation that was recorded.
        generation: Generation,
        /// Counters for the walk.
        stats: IndexStats,
    },
}

impl IndexOutcome {
    /// The generation the later phases operate on.
    #[must_use]
    pub fn generation(&self) -> &Generation {
        match self {
            Self::Reused(generation) | Self::Built { generation, .. } => generation,
        }
    }

    /// Entries skipped during the walk (0 when reused).
    #[must_use]
    pub fn errors(&self) -> u64 {
        match self {
            Self::Reused(_) => 0,
            Self::Built { stats, .. } => stats.errors,
        }
    }
}

/// Check that `root` is an existing directory and make it absolute.
///
/// # Errors
///
/// [`PipelineError::PathNotFound`] or [`PipelineError::NotADirectory`].
pub fn validate_root(root: &Path) -> Result<PathBuf, PipelineError> {
    if !root.exists() {
        return Err(PipelineError::PathNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(PipelineError::NotADirectory(root.to_path_buf()));
    }
    root.canonicalize()
        .map_err(|_| PipelineError::PathNotFound(root.to_path_buf()))
}

/// Builds or reuses the index generation.
pub struct Indexer<'a> {
    index: &'a dyn FileIndex,
    walker_config: WalkerConfig,
    progress: Option<Arc<dyn ProgressCallback>>,
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl<'a> Indexer<'a> {
    /// Create an indexer writing into `index`.
    #[must_use]
    pub fn new(index: &'a dyn FileIndex, walker_config: WalkerConfig) -> Self {
        Self {
            index,
            walker_config,
            progress: None,
            shutdown_flag: None,
        }
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

    /// Reuse the completed generation or walk `root` into a new one.
    ///
    /// `root` must already be validated with [`validate_root`].
    ///
    /// # Errors
    ///
    /// [`PipelineError::Index`] when the index fails, and
    /// [`PipelineError::Interrupted`] when the walk was cut short. An
    /// interrupted walk records no generation.
    pub fn build(&self, root: &Path, reset: bool) -> Result<IndexOutcome, PipelineError> {
        if !reset {
            if let Some(generation) = self.index.generation()? {
                if generation.root != root {
                    log::warn!(
                        "Reusing index built for {} while scanning {}; pass --reset to rebuild",
                        generation.root.display(),
                        root.display()
                    );
                }
                log::info!(
                    "Reusing existing index of {} files from {}",
                    generation.files,
                    generation.indexed_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                return Ok(IndexOutcome::Reused(generation));
            }
        }

        self.index.reset()?;
        let stats = self.walk(root)?;

        if self.is_shutdown_requested() {
            self.index.flush()?;
            return Err(PipelineError::Interrupted);
        }

        let generation = Generation::completed_now(root, self.index.count()?);
        self.index.complete_generation(&generation)?;
        log::info!(
            "Indexed {} files under {} ({} skipped)",
            stats.files_indexed,
            root.display(),
            stats.errors
        );
        Ok(IndexOutcome::Built { generation, stats })
    }

    fn walk(&self, root: &Path) -> Result<IndexStats, PipelineError> {
        let mut walker = Walker::new(root, self.walker_config.clone());
        if let Some(flag) = &self.shutdown_flag {
            walker = walker.with_shutdown_flag(Arc::clone(flag));
        }

        if let Some(progress) = &self.progress {
            progress.on_phase_start(PHASE_INDEXING, 0);
        }

        let mut stats = IndexStats::default();
        for entry in walker.walk() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => {
                    // the walker already logged it
                    stats.errors += 1;
                    continue;
                }
            };

            match self.index.insert(&entry.path, entry.size) {
                Ok(true) => {
                    stats.files_indexed += 1;
                    log::trace!("Indexed {} ({} bytes)", entry.path.display(), entry.size);
                }
                Ok(false) => {
                    stats.duplicate_paths += 1;
                    log::debug!("Path already indexed: {}", entry.path.display());
                }
                Err(e @ crate::index::IndexError::NonUtf8Path(_)) => {
                    log::warn!("Skipping {}", e);
                    stats.errors += 1;
                }
                Err(e) => return Err(e.into()),
            }

            if let Some(progress) = &self.progress {
                progress.on_progress(stats.files_indexed, &entry.path.to_string_lossy());
            }
        }

        self.index.flush()?;
        if let Some(progress) = &self.progress {
            progress.on_phase_end(PHASE_INDEXING);
        }
        Ok(stats)
    }
}
