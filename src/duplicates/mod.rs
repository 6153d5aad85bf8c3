//! Staged duplicate removal.
//!
//! The pipeline runs three phases over a [`FileIndex`], each one a full
//! barrier:
//!
//! 1. [`Indexer`] walks the tree into the index (or reuses a complete one)
//! 2. [`SizeComparator`] assigns short digests to size collisions
//! 3. [`Resolver`] verifies candidates with full digests and a byte-exact
//!    comparison, reports them and removes them
//!
//! Every phase is idempotent over the state the previous run left in the
//! index, so an interrupted scan resumes where it stopped.

pub mod comparator;
pub mod indexer;
pub mod resolver;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use comparator::{CompareStats, SizeComparator};
pub use indexer::{validate_root, IndexOutcome, IndexStats, Indexer};
pub use resolver::{ResolveStats, Resolver};

use crate::index::{FileIndex, IndexError, DEFAULT_PAGE_SIZE};
use crate::progress::ProgressCallback;
use crate::scanner::{Fingerprinter, WalkerConfig};
use crate::store::FileStore;

/// Errors that stop the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The scan was interrupted by user (Ctrl+C or shutdown signal).
    #[error("Scan interrupted by user")]
    Interrupted,

    /// The provided path does not exist.
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// The provided path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The file index failed.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// The report sink could not be written.
    #[error("Failed to write duplicate report: {0}")]
    Output(#[source] std::io::Error),
}

/// Configuration for a pipeline run.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Discard any existing index before walking.
    pub reset: bool,
    /// Report duplicates without deleting them.
    pub report_only: bool,
    /// Walker configuration for directory traversal.
    pub walker_config: WalkerConfig,
    /// Rows fetched per index page.
    pub page_size: usize,
    /// Optional shutdown flag for graceful termination.
    pub shutdown_flag: Option<Arc<AtomicBool>>,
    /// Optional progress callback for reporting.
    pub progress_callback: Option<Arc<dyn ProgressCallback>>,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("reset", &self.reset)
            .field("report_only", &self.report_only)
            .field("walker_config", &self.walker_config)
            .field("page_size", &self.page_size)
            .field("shutdown_flag", &self.shutdown_flag)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reset: false,
            report_only: false,
            walker_config: WalkerConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            shutdown_flag: None,
            progress_callback: None,
        }
    }
}

impl PipelineConfig {
    /// Rebuild the index even when a complete one exists.
    #[must_use]
    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Report only, never delete.
    #[must_use]
    pub fn with_report_only(mut self, report_only: bool) -> Self {
        self.report_only = report_only;
        self
    }

    /// Set the walker configuration.
    #[must_use]
    pub fn with_walker_config(mut self, config: WalkerConfig) -> Self {
        self.walker_config = config;
        self
    }

    /// Set the scan page size (at least 1).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the shutdown flag.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    /// Set the progress callback.
    #[must_use]
    pub fn with_progress_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress_callback = Some(callback);
        self
    }
}

/// What a complete run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Result of the indexing phase.
    pub outcome: IndexOutcome,
    /// Counters from the size comparator.
    pub compare: CompareStats,
    /// Counters from the resolver.
    pub resolve: ResolveStats,
}

impl PipelineSummary {
    /// Whether any duplicate was reported.
    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        self.resolve.duplicates > 0
    }

    /// Whether the run skipped entries or failed to delete something.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.outcome.errors() > 0 || self.resolve.failed_removals > 0
    }
}

/// Runs the three phases in order.
#[derive(Debug, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline with the given configuration.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Index `root`, compare, then resolve into `sink`.
    ///
    /// The root is validated before the index is touched.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`]; per-file problems are absorbed and counted
    /// instead.
    pub fn run(
        &self,
        root: &Path,
        index: &dyn FileIndex,
        store: &dyn FileStore,
        fingerprinter: &dyn Fingerprinter,
        sink: &mut dyn Write,
    ) -> Result<PipelineSummary, PipelineError> {
        let root = validate_root(root)?;
        let config = &self.config;

        let outcome = Indexer::new(index, config.walker_config.clone())
            .with_progress_callback(config.progress_callback.clone())
            .with_shutdown_flag(config.shutdown_flag.clone())
            .build(&root, config.reset)?;

        let compare = SizeComparator::new(index, store, fingerprinter)
            .with_page_size(config.page_size)
            .with_progress_callback(config.progress_callback.clone())
            .with_shutdown_flag(config.shutdown_flag.clone())
            .run()?;

        let resolve = Resolver::new(index, store, fingerprinter)
            .with_report_only(config.report_only)
            .with_page_size(config.page_size)
            .with_progress_callback(config.progress_callback.clone())
            .with_shutdown_flag(config.shutdown_flag.clone())
            .run(sink)?;

        Ok(PipelineSummary {
            outcome,
            compare,
            resolve,
        })
    }
}
