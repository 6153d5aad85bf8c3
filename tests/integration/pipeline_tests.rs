//! End-to-end runs over real directories with the SQLite index.

use dupesweep::duplicates::{IndexOutcome, Pipeline, PipelineConfig, PipelineSummary};
use dupesweep::index::{FileIndex, SqliteIndex};
use dupesweep::scanner::{Hasher, WalkerConfig};
use dupesweep::store::{DeleteMode, OsFileStore};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A tree under `root/` and an index outside it.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(files: &[(&str, &[u8])]) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        for (name, contents) in files {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, contents).unwrap();
        }
        Self { dir }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("root").canonicalize().unwrap()
    }

    fn index(&self) -> SqliteIndex {
        SqliteIndex::open(&self.dir.path().join("index.db")).unwrap()
    }

    fn run(&self, config: PipelineConfig) -> (PipelineSummary, Vec<String>) {
        let index = self.index();
        let store = OsFileStore::new(DeleteMode::Permanent);
        let mut sink = Vec::new();
        let summary = Pipeline::new(config)
            .run(&self.root(), &index, &store, &Hasher::new(), &mut sink)
            .unwrap();
        let lines = String::from_utf8(sink)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        (summary, lines)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    fn display(&self, name: &str) -> String {
        self.path(name).display().to_string()
    }
}

#[test]
fn test_reference_scenario_reports_only_b() {
    let fx = Fixture::new(&[
        ("a", &[b'X'; 10]),
        ("b", &[b'X'; 10]),
        ("c", &[b'Y'; 10]),
        ("d", &[b'Z'; 20]),
    ]);

    let (summary, lines) = fx.run(PipelineConfig::default());

    assert_eq!(lines, vec![fx.display("b")]);
    assert!(fx.path("a").exists());
    assert!(!fx.path("b").exists());
    assert!(fx.path("c").exists());
    assert!(fx.path("d").exists());
    assert_eq!(summary.compare.hashed, 3);
    assert_eq!(summary.resolve.removed, 1);
    assert_eq!(summary.resolve.bytes_reclaimed, 10);

    let index = fx.index();
    let records: Vec<_> = dupesweep::index::Scan::new(
        &index,
        dupesweep::index::ScanOrder::BySize,
        10,
    )
    .collect::<Result<_, _>>()
    .unwrap();
    let d = records.iter().find(|r| r.path == fx.path("d")).unwrap();
    assert!(d.digest.is_none(), "unique size must never be hashed");
}

#[test]
fn test_report_only_deletes_nothing() {
    let fx = Fixture::new(&[("one", b"same"), ("two", b"same")]);

    let (summary, lines) = fx.run(PipelineConfig::default().with_report_only(true));

    assert_eq!(lines, vec![fx.display("two")]);
    assert_eq!(summary.resolve.removed, 0);
    assert!(fx.path("one").exists());
    assert!(fx.path("two").exists());
}

#[test]
fn test_nested_copies_keep_smallest_path() {
    let fx = Fixture::new(&[
        ("z/copy.txt", b"payload"),
        ("a/copy.txt", b"payload"),
        ("m/other.txt", b"payload"),
    ]);

    let (_, lines) = fx.run(PipelineConfig::default());

    assert_eq!(lines, vec![fx.display("m/other.txt"), fx.display("z/copy.txt")]);
    assert!(fx.path("a/copy.txt").exists());
}

#[test]
fn test_no_duplicates() {
    let fx = Fixture::new(&[("a", b"1"), ("b", b"22"), ("c", b"33")]);

    let (summary, lines) = fx.run(PipelineConfig::default());

    assert!(lines.is_empty());
    assert!(!summary.has_duplicates());
    assert_eq!(summary.compare.hashed, 2);
}

#[test]
fn test_walker_filters_apply() {
    let fx = Fixture::new(&[
        ("keep1", b"data"),
        ("keep2", b"data"),
        ("skip.tmp", b"data"),
        (".hidden", b"data"),
    ]);
    let walker = WalkerConfig {
        skip_hidden: true,
        ignore_patterns: vec!["*.tmp".to_string()],
        ..WalkerConfig::default()
    };

    let (summary, lines) = fx.run(PipelineConfig::default().with_walker_config(walker));

    assert_eq!(lines, vec![fx.display("keep2")]);
    assert!(fx.path("skip.tmp").exists());
    assert!(fx.path(".hidden").exists());
    match summary.outcome {
        IndexOutcome::Built { stats, .. } => assert_eq!(stats.files_indexed, 2),
        other => panic!("expected a fresh build, got {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn test_followed_link_never_costs_its_target() {
    let fx = Fixture::new(&[("z_real", b"precious data")]);
    std::os::unix::fs::symlink(fx.path("z_real"), fx.path("a_link")).unwrap();
    let walker = WalkerConfig {
        follow_symlinks: true,
        ..WalkerConfig::default()
    };

    let (summary, lines) = fx.run(PipelineConfig::default().with_walker_config(walker));

    assert!(lines.is_empty());
    assert_eq!(fs::read(fx.path("z_real")).unwrap(), b"precious data");
    assert_eq!(fs::read(fx.path("a_link")).unwrap(), b"precious data");
    assert_eq!(summary.resolve.removed, 0);
    match summary.outcome {
        IndexOutcome::Built { stats, .. } => assert_eq!(stats.files_indexed, 1),
        other => panic!("expected a fresh build, got {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn test_followed_link_with_a_real_copy_keeps_the_data() {
    let fx = Fixture::new(&[("b_copy", b"precious data"), ("z_real", b"precious data")]);
    std::os::unix::fs::symlink(fx.path("z_real"), fx.path("a_link")).unwrap();
    let walker = WalkerConfig {
        follow_symlinks: true,
        ..WalkerConfig::default()
    };

    let (_, lines) = fx.run(PipelineConfig::default().with_walker_config(walker));

    assert_eq!(lines, vec![fx.display("b_copy")]);
    assert!(!fx.path("b_copy").exists());
    assert_eq!(fs::read(fx.path("z_real")).unwrap(), b"precious data");
    assert_eq!(fs::read(fx.path("a_link")).unwrap(), b"precious data");
}

#[test]
fn test_empty_files_are_duplicates_unless_skipped() {
    let fx = Fixture::new(&[("e1", b""), ("e2", b"")]);
    let (_, lines) = fx.run(
        PipelineConfig::default()
            .with_report_only(true)
            .with_walker_config(WalkerConfig {
                skip_empty: true,
                ..WalkerConfig::default()
            }),
    );
    assert!(lines.is_empty());

    let (_, lines) = fx.run(PipelineConfig::default().with_reset(true));
    assert_eq!(lines, vec![fx.display("e2")]);
}

#[test]
fn test_index_inside_root_is_not_indexed() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    fs::write(root.join("a"), b"same").unwrap();
    fs::write(root.join("b"), b"same").unwrap();
    let db = root.join("index.db");
    let index = SqliteIndex::open(&db).unwrap();
    let walker = WalkerConfig::default()
        .with_excluded(db.clone())
        .with_excluded(PathBuf::from(format!("{}-wal", db.display())))
        .with_excluded(PathBuf::from(format!("{}-shm", db.display())));

    let mut sink = Vec::new();
    let summary = Pipeline::new(PipelineConfig::default().with_walker_config(walker))
        .run(
            &root,
            &index,
            &OsFileStore::new(DeleteMode::Permanent),
            &Hasher::new(),
            &mut sink,
        )
        .unwrap();

    assert_eq!(summary.outcome.generation().files, 2);
    assert!(db.exists());
    assert!(!root.join("b").exists());
}

#[test]
fn test_many_files_across_pages() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    fs::create_dir(&root).unwrap();
    for i in 0..40 {
        // every size appears twice, with identical contents
        let contents = vec![b'q'; i / 2 + 1];
        fs::write(root.join(format!("f{i:02}")), contents).unwrap();
    }
    let index = SqliteIndex::open(&dir.path().join("index.db"))
        .unwrap()
        .with_write_batch(7);

    let mut sink = Vec::new();
    let summary = Pipeline::new(PipelineConfig::default().with_page_size(3))
        .run(
            &root,
            &index,
            &OsFileStore::new(DeleteMode::Permanent),
            &Hasher::new(),
            &mut sink,
        )
        .unwrap();

    assert_eq!(summary.resolve.duplicates, 20);
    assert_eq!(fs::read_dir(&root).unwrap().count(), 20);
    assert_eq!(index.count().unwrap(), 40);
    assert!(Path::new(&root.join("f00")).exists());
    assert!(!root.join("f01").exists());
}
