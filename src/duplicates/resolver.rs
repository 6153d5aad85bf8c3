//! Phase 3: verify and remove duplicates.
//!
//! # Overview
//!
//! Records with a short digest are streamed in `(digest, path)` order. Within
//! a run of equal short digests, the first file of each distinct content is
//! kept under its full digest and every later file is checked against the
//! kept files with the same full digest:
//!
//! 1. full digests (computed lazily, at most once per file) must match
//! 2. [`bytes_equal`] must confirm the contents byte for byte
//!
//! A confirmed duplicate is written to the sink and, unless running in
//! report-only mode, deleted through the [`FileStore`]. The kept file is
//! always the smallest path of its content class in byte order.
//!
//! A full-digest match that fails the byte check is a hash collision: it is
//! logged and both files stay.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::PipelineError;
use crate::index::{FileIndex, FileRecord, Scan, ScanOrder, DEFAULT_PAGE_SIZE};
use crate::progress::{ProgressCallback, PHASE_DEDUPING};
use crate::scanner::{bytes_equal, Digest, Fingerprinter};
use crate::store::FileStore;

/// Counters from the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// Digested records streamed.
    pub candidates: u64,
    /// Verified duplicates written to the sink.
    pub duplicates: u64,
    /// Duplicates deleted from disk.
    pub removed: u64,
    /// Duplicates whose deletion failed.
    pub failed_removals: u64,
    /// Full-digest matches rejected by the byte comparison.
    pub collisions: u64,
    /// Candidates that could no longer be read.
    pub vanished: u64,
    /// Indexed size of the removed files (or of the reported ones in
    /// report-only mode).
    pub bytes_reclaimed: u64,
}

/// Files sharing one short digest.
#[derive(Debug)]
struct DigestRun {
    digest: String,
    /// First file of the run, not yet fully hashed.
    first: Option<PathBuf>,
    /// Retained files by full digest. Colliding contents share a key.
    kept: HashMap<String, Vec<PathBuf>>,
}

impl DigestRun {
    fn new(digest: String, first: PathBuf) -> Self {
        Self {
            digest,
            first: Some(first),
            kept: HashMap::new(),
        }
    }
}

/// Fold state threaded through the scan.
#[derive(Debug, Default)]
struct Fold {
    run: Option<DigestRun>,
    stats: ResolveStats,
}

/// Streams digest runs, verifies candidates and removes duplicates.
pub struct Resolver<'a> {
    index: &'a dyn FileIndex,
    store: &'a dyn FileStore,
    fingerprinter: &'a dyn Fingerprinter,
    report_only: bool,
    page_size: usize,
    progress: Option<Arc<dyn ProgressCallback>>,
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl<'a> Resolver<'a> {
    /// Create a resolver that deletes verified duplicates.
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
            report_only: false,
            page_size: DEFAULT_PAGE_SIZE,
            progress: None,
            shutdown_flag: None,
        }
    }

    /// Report duplicates without deleting them.
    #[must_use]
    pub fn with_report_only(mut self, report_only: bool) -> Self {
        self.report_only = report_only;
        self
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

    /// Resolve every digest run, writing one duplicate path per line to `sink`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Index`] on index failure, [`PipelineError::Output`]
    /// when the sink cannot be written and [`PipelineError::Interrupted`] when
    /// the shutdown flag is raised. The sink is flushed in every case.
    pub fn run(&self, sink: &mut dyn Write) -> Result<ResolveStats, PipelineError> {
        if let Some(progress) = &self.progress {
            progress.on_phase_start(PHASE_DEDUPING, self.index.count_digested()?);
        }

        let folded = Scan::new(self.index, ScanOrder::ByDigest, self.page_size).try_fold(
            Fold::default(),
            |fold, record| {
                if self.is_shutdown_requested() {
                    return Err(PipelineError::Interrupted);
                }
                self.step(fold, record?, sink)
            },
        );
        sink.flush().map_err(PipelineError::Output)?;
        let Fold { stats, .. } = folded?;

        if let Some(progress) = &self.progress {
            progress.on_phase_end(PHASE_DEDUPING);
        }
        log::info!(
            "De-duping done: {} duplicates detected, {} removed",
            stats.duplicates,
            stats.removed
        );
        Ok(stats)
    }

    fn step(
        &self,
        mut fold: Fold,
        record: FileRecord,
        sink: &mut dyn Write,
    ) -> Result<Fold, PipelineError> {
        fold.stats.candidates += 1;
        if let Some(progress) = &self.progress {
            progress.on_progress(fold.stats.candidates, &record.path.to_string_lossy());
        }

        let digest = match &record.digest {
            Some(Digest::Value(digest)) => digest.clone(),
            // the digest scan filters these out; a sentinel never groups
            _ => return Ok(fold),
        };

        match fold.run.as_mut() {
            Some(run) if run.digest == digest => {
                self.resolve_candidate(run, record, sink, &mut fold.stats)?;
            }
            _ => fold.run = Some(DigestRun::new(digest, record.path)),
        }
        Ok(fold)
    }

    fn resolve_candidate(
        &self,
        run: &mut DigestRun,
        record: FileRecord,
        sink: &mut dyn Write,
        stats: &mut ResolveStats,
    ) -> Result<(), PipelineError> {
        let full = match self.fingerprinter.full_digest(self.store, &record.path) {
            Digest::Value(full) => full,
            Digest::NotFound => {
                log::debug!("Candidate vanished: {}", record.path.display());
                stats.vanished += 1;
                return Ok(());
            }
        };

        if let Some(first) = run.first.take() {
            match self.fingerprinter.full_digest(self.store, &first) {
                Digest::Value(first_full) => run.kept.entry(first_full).or_default().push(first),
                Digest::NotFound => log::debug!("Kept file vanished: {}", first.display()),
            }
        }

        let same_full = run.kept.entry(full).or_default();
        for kept in same_full.iter() {
            if bytes_equal(self.store, kept, &record.path) {
                log::debug!(
                    "Duplicate: {} (keeping {})",
                    record.path.display(),
                    kept.display()
                );
                return self.emit(&record, sink, stats);
            }
            stats.collisions += 1;
            log::warn!(
                "Digest collision between {} and {}; contents differ, keeping both",
                kept.display(),
                record.path.display()
            );
        }
        same_full.push(record.path);
        Ok(())
    }

    fn emit(
        &self,
        record: &FileRecord,
        sink: &mut dyn Write,
        stats: &mut ResolveStats,
    ) -> Result<(), PipelineError> {
        writeln!(sink, "{}", record.path.display()).map_err(PipelineError::Output)?;
        stats.duplicates += 1;

        if self.report_only {
            stats.bytes_reclaimed += record.size;
            return Ok(());
        }

        match self.store.delete(&record.path) {
            Ok(()) => {
                stats.removed += 1;
                stats.bytes_reclaimed += record.size;
                log::trace!("Removed {}", record.path.display());
            }
            Err(e) => {
                stats.failed_removals += 1;
                log::error!("Failed to remove {}: {}", record.path.display(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::scanner::Hasher;
    use crate::store::MemoryFileStore;
    use std::path::Path;

    /// Index every file with the short digest the comparator would assign.
    fn setup(files: &[(&str, &[u8])]) -> (MemoryIndex, MemoryFileStore) {
        let index = MemoryIndex::new();
        let store = MemoryFileStore::new();
        let hasher = Hasher::new();
        for (path, contents) in files {
            store.insert(*path, contents.to_vec());
            index.insert(Path::new(path), contents.len() as u64).unwrap();
            let digest = hasher.short_digest(&store, Path::new(path));
            index.update_digest(Path::new(path), &digest).unwrap();
        }
        (index, store)
    }

    fn lines(sink: &[u8]) -> Vec<String> {
        String::from_utf8(sink.to_vec())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_later_path_is_removed() {
        let (index, store) = setup(&[("/b", b"same"), ("/a", b"same"), ("/c", b"diff")]);
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .run(&mut sink)
            .unwrap();

        assert_eq!(lines(&sink), vec!["/b"]);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.bytes_reclaimed, 4);
        assert!(store.contains(Path::new("/a")));
        assert!(!store.contains(Path::new("/b")));
        assert!(store.contains(Path::new("/c")));
    }

    #[test]
    fn test_report_only_keeps_files() {
        let (index, store) = setup(&[("/a", b"same"), ("/b", b"same")]);
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .with_report_only(true)
            .run(&mut sink)
            .unwrap();

        assert_eq!(lines(&sink), vec!["/b"]);
        assert_eq!(stats.removed, 0);
        assert!(store.contains(Path::new("/b")));
    }

    #[test]
    fn test_three_copies_keep_only_the_first() {
        let (index, store) = setup(&[("/a", b"copy"), ("/b", b"copy"), ("/c", b"copy")]);
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        Resolver::new(&index, &store, &hasher)
            .with_page_size(1)
            .run(&mut sink)
            .unwrap();

        assert_eq!(lines(&sink), vec!["/b", "/c"]);
        assert_eq!(store.paths(), vec![PathBuf::from("/a")]);
    }

    #[test]
    fn test_shared_prefix_different_tails() {
        // identical first 1024 bytes, so one short-digest run with two contents
        let prefix = vec![b'P'; 1024];
        let x = [prefix.as_slice(), b"X"].concat();
        let y = [prefix.as_slice(), b"Y"].concat();
        let (index, store) = setup(&[("/a", &x), ("/b", &y), ("/c", &x), ("/d", &y)]);
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .run(&mut sink)
            .unwrap();

        assert_eq!(lines(&sink), vec!["/c", "/d"]);
        assert_eq!(stats.collisions, 0);
        assert_eq!(store.paths(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn test_wide_shared_prefix_run() {
        // 60 files in one short-digest run, 12 distinct tails, 5 copies each
        let prefix = vec![b'P'; 1024];
        let files: Vec<(String, Vec<u8>)> = (0..60)
            .map(|i| {
                let tail = format!("tail-{}", i % 12);
                (format!("/f{i:02}"), [prefix.as_slice(), tail.as_bytes()].concat())
            })
            .collect();
        let refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(path, contents)| (path.as_str(), contents.as_slice()))
            .collect();
        let (index, store) = setup(&refs);
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .with_page_size(7)
            .run(&mut sink)
            .unwrap();

        let expected: Vec<String> = (12..60).map(|i| format!("/f{i:02}")).collect();
        assert_eq!(lines(&sink), expected);
        assert_eq!(stats.candidates, 60);
        assert_eq!(stats.duplicates, 48);
        assert_eq!(stats.collisions, 0);
        let survivors: Vec<PathBuf> = (0..12)
            .map(|i| PathBuf::from(format!("/f{i:02}")))
            .collect();
        assert_eq!(store.paths(), survivors);
    }

    #[test]
    fn test_colliding_contents_share_a_key() {
        let index = MemoryIndex::new();
        let store = MemoryFileStore::new();
        for (path, contents) in [
            ("/a", b"left"),
            ("/b", b"rite"),
            ("/c", b"rite"),
            ("/d", b"left"),
        ] {
            store.insert(path, contents.to_vec());
            index.insert(Path::new(path), 4).unwrap();
            index
                .update_digest(Path::new(path), &Digest::Value("s-collide".into()))
                .unwrap();
        }
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &CollidingHasher)
            .run(&mut sink)
            .unwrap();

        // /c collides with /a before matching /b; /d matches /a first
        assert_eq!(lines(&sink), vec!["/c", "/d"]);
        assert_eq!(stats.collisions, 2);
        assert_eq!(store.paths(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn test_vanished_candidate_is_skipped() {
        let (index, store) = setup(&[("/a", b"same"), ("/b", b"same")]);
        store.remove(Path::new("/b"));
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .run(&mut sink)
            .unwrap();
        assert!(sink.is_empty());
        assert_eq!(stats.vanished, 1);
    }

    #[test]
    fn test_vanished_kept_file_protects_candidate() {
        let (index, store) = setup(&[("/a", b"same"), ("/b", b"same")]);
        store.remove(Path::new("/a"));
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .run(&mut sink)
            .unwrap();
        assert!(sink.is_empty());
        assert!(store.contains(Path::new("/b")));
        assert_eq!(stats.duplicates, 0);
    }

    #[test]
    fn test_failed_delete_is_counted_and_processing_continues() {
        let (index, store) = setup(&[
            ("/a", b"one"),
            ("/b", b"one"),
            ("/c", b"two"),
            ("/d", b"two"),
        ]);
        store.lock("/b");
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .run(&mut sink)
            .unwrap();

        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.failed_removals, 1);
        assert!(store.contains(Path::new("/b")));
        assert!(!store.contains(Path::new("/d")));
    }

    #[test]
    fn test_not_found_records_never_group() {
        let index = MemoryIndex::new();
        let store = MemoryFileStore::new();
        for path in ["/a", "/b"] {
            index.insert(Path::new(path), 1).unwrap();
            index
                .update_digest(Path::new(path), &Digest::NotFound)
                .unwrap();
        }
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &hasher)
            .run(&mut sink)
            .unwrap();
        assert_eq!(stats.candidates, 0);
        assert!(sink.is_empty());
    }

    /// Every file has the same full digest, whatever its contents.
    struct CollidingHasher;

    impl Fingerprinter for CollidingHasher {
        fn short_digest(&self, _store: &dyn FileStore, _path: &Path) -> Digest {
            Digest::Value("s-collide".to_string())
        }

        fn full_digest(&self, _store: &dyn FileStore, _path: &Path) -> Digest {
            Digest::Value("collide".to_string())
        }
    }

    #[test]
    fn test_full_digest_collision_is_not_deleted() {
        let index = MemoryIndex::new();
        let store = MemoryFileStore::new();
        for (path, contents) in [("/a", b"left"), ("/b", b"rite")] {
            store.insert(path, contents.to_vec());
            index.insert(Path::new(path), 4).unwrap();
            index
                .update_digest(Path::new(path), &Digest::Value("s-collide".into()))
                .unwrap();
        }
        let mut sink = Vec::new();

        let stats = Resolver::new(&index, &store, &CollidingHasher)
            .run(&mut sink)
            .unwrap();

        assert!(sink.is_empty());
        assert_eq!(stats.collisions, 1);
        assert_eq!(stats.removed, 0);
        assert!(store.contains(Path::new("/a")));
        assert!(store.contains(Path::new("/b")));
    }

    #[test]
    fn test_shutdown_flag_interrupts() {
        let (index, store) = setup(&[("/a", b"same"), ("/b", b"same")]);
        let hasher = Hasher::new();
        let mut sink = Vec::new();

        let result = Resolver::new(&index, &store, &hasher)
            .with_shutdown_flag(Some(Arc::new(AtomicBool::new(true))))
            .run(&mut sink);
        assert!(matches!(result, Err(PipelineError::Interrupted)));
        assert!(store.contains(Path::new("/b")));
    }
}
