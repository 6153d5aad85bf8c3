//! Interrupting a run at any phase and running again gives the same result
//! as one uninterrupted run.

use dupesweep::duplicates::{IndexOutcome, Pipeline, PipelineConfig, PipelineError};
use dupesweep::index::{FileIndex, SqliteIndex};
use dupesweep::progress::{ProgressCallback, PHASE_COMPARING, PHASE_DEDUPING, PHASE_INDEXING};
use dupesweep::scanner::Hasher;
use dupesweep::store::{DeleteMode, OsFileStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Raises the shutdown flag after `after` progress events of `phase`.
struct InterruptAt {
    phase: &'static str,
    after: u64,
    flag: Arc<AtomicBool>,
    current: Mutex<String>,
    seen: AtomicU64,
}

impl InterruptAt {
    fn new(phase: &'static str, after: u64, flag: Arc<AtomicBool>) -> Self {
        Self {
            phase,
            after,
            flag,
            current: Mutex::new(String::new()),
            seen: AtomicU64::new(0),
        }
    }
}

impl ProgressCallback for InterruptAt {
    fn on_phase_start(&self, phase: &str, _total: u64) {
        *self.current.lock().unwrap() = phase.to_string();
    }

    fn on_progress(&self, _current: u64, _path: &str) {
        if *self.current.lock().unwrap() != self.phase {
            return;
        }
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    fn on_phase_end(&self, _phase: &str) {}
}

fn tree(dir: &Path) -> PathBuf {
    let root = dir.join("root");
    fs::create_dir(&root).unwrap();
    for i in 0..12 {
        let contents = format!("content-{}", i % 4);
        fs::write(root.join(format!("f{i:02}")), contents).unwrap();
    }
    fs::write(root.join("unique"), b"nothing like the others").unwrap();
    root.canonicalize().unwrap()
}

fn survivors(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn run(
    root: &Path,
    db: &Path,
    config: PipelineConfig,
) -> Result<dupesweep::duplicates::PipelineSummary, PipelineError> {
    let index = SqliteIndex::open(db).unwrap().with_write_batch(3);
    let mut sink = Vec::new();
    Pipeline::new(config).run(
        root,
        &index,
        &OsFileStore::new(DeleteMode::Permanent),
        &Hasher::new(),
        &mut sink,
    )
}

fn interrupted_then_resumed(phase: &'static str, after: u64) -> Vec<String> {
    let dir = TempDir::new().unwrap();
    let root = tree(dir.path());
    let db = dir.path().join("index.db");

    let flag = Arc::new(AtomicBool::new(false));
    let callback = Arc::new(InterruptAt::new(phase, after, Arc::clone(&flag)));
    let result = run(
        &root,
        &db,
        PipelineConfig::default()
            .with_shutdown_flag(flag)
            .with_progress_callback(callback),
    );
    assert!(matches!(result, Err(PipelineError::Interrupted)), "{phase}");

    run(&root, &db, PipelineConfig::default()).unwrap();
    survivors(&root)
}

fn expected() -> Vec<String> {
    vec!["f00", "f01", "f02", "f03", "unique"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[test]
fn test_uninterrupted_run() {
    let dir = TempDir::new().unwrap();
    let root = tree(dir.path());
    let summary = run(&root, &dir.path().join("index.db"), PipelineConfig::default()).unwrap();
    assert_eq!(summary.resolve.removed, 8);
    assert_eq!(survivors(&root), expected());
}

#[test]
fn test_resume_after_interrupted_indexing() {
    assert_eq!(interrupted_then_resumed(PHASE_INDEXING, 5), expected());
}

#[test]
fn test_resume_after_interrupted_comparing() {
    assert_eq!(interrupted_then_resumed(PHASE_COMPARING, 4), expected());
}

#[test]
fn test_resume_after_interrupted_deduping() {
    assert_eq!(interrupted_then_resumed(PHASE_DEDUPING, 6), expected());
}

#[test]
fn test_interrupted_indexing_rebuilds_on_next_run() {
    let dir = TempDir::new().unwrap();
    let root = tree(dir.path());
    let db = dir.path().join("index.db");

    let flag = Arc::new(AtomicBool::new(false));
    let callback = Arc::new(InterruptAt::new(PHASE_INDEXING, 2, Arc::clone(&flag)));
    let config = PipelineConfig::default()
        .with_report_only(true)
        .with_shutdown_flag(flag)
        .with_progress_callback(callback);
    assert!(run(&root, &db, config).is_err());
    assert!(SqliteIndex::open(&db).unwrap().generation().unwrap().is_none());

    let summary = run(&root, &db, PipelineConfig::default().with_report_only(true)).unwrap();
    assert!(matches!(summary.outcome, IndexOutcome::Built { .. }));
    assert_eq!(summary.outcome.generation().files, 13);
}

#[test]
fn test_second_run_reuses_index_and_deletes_nothing() {
    let dir = TempDir::new().unwrap();
    let root = tree(dir.path());
    let db = dir.path().join("index.db");

    run(&root, &db, PipelineConfig::default()).unwrap();
    let summary = run(&root, &db, PipelineConfig::default()).unwrap();

    assert!(matches!(summary.outcome, IndexOutcome::Reused(_)));
    assert_eq!(summary.compare.hashed, 0);
    assert_eq!(summary.resolve.removed, 0);
    assert_eq!(summary.resolve.duplicates, 0);
    assert_eq!(survivors(&root), expected());
}
