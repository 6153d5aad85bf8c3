//! Both index backends must agree on ordering, filtering and paging.

use dupesweep::index::{
    FileIndex, FileRecord, Generation, MemoryIndex, Scan, ScanOrder, SqliteIndex,
};
use dupesweep::scanner::Digest;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn backends() -> Vec<(&'static str, Box<dyn FileIndex>)> {
    vec![
        ("memory", Box::new(MemoryIndex::new())),
        (
            "sqlite",
            Box::new(SqliteIndex::open_in_memory().unwrap().with_write_batch(2)),
        ),
    ]
}

fn populate(index: &dyn FileIndex) {
    let rows: [(&str, u64, Option<&str>); 7] = [
        ("/b", 10, Some("s-aa")),
        ("/a", 10, Some("s-aa")),
        ("/c", 10, Some("s-bb")),
        ("/d", 20, None),
        ("/B", 30, Some("s-bb")),
        ("/e", 30, Some("not_found")),
        ("/f", 30, Some("not_found")),
    ];
    for (path, size, digest) in rows {
        assert!(index.insert(Path::new(path), size).unwrap());
        if let Some(digest) = digest.and_then(Digest::from_stored) {
            index.update_digest(Path::new(path), &digest).unwrap();
        }
    }
    index.flush().unwrap();
}

fn scan(index: &dyn FileIndex, order: ScanOrder, page_size: usize) -> Vec<FileRecord> {
    Scan::new(index, order, page_size)
        .collect::<Result<_, _>>()
        .unwrap()
}

fn paths(records: &[FileRecord]) -> Vec<&str> {
    records.iter().map(|r| r.path.to_str().unwrap()).collect()
}

#[test]
fn test_size_order_is_size_then_bytewise_path() {
    for (name, index) in backends() {
        populate(index.as_ref());
        for page_size in [1, 2, 3, 50] {
            let records = scan(index.as_ref(), ScanOrder::BySize, page_size);
            assert_eq!(
                paths(&records),
                vec!["/a", "/b", "/c", "/d", "/B", "/e", "/f"],
                "{name} page {page_size}"
            );
        }
    }
}

#[test]
fn test_digest_order_skips_undigested_and_sentinel() {
    for (name, index) in backends() {
        populate(index.as_ref());
        for page_size in [1, 2, 50] {
            let records = scan(index.as_ref(), ScanOrder::ByDigest, page_size);
            // "/B" sorts before "/c" byte-wise
            assert_eq!(
                paths(&records),
                vec!["/a", "/b", "/B", "/c"],
                "{name} page {page_size}"
            );
        }
        assert_eq!(index.count().unwrap(), 7, "{name}");
        assert_eq!(index.count_digested().unwrap(), 4, "{name}");
    }
}

#[test]
fn test_duplicate_insert_keeps_first_record() {
    for (name, index) in backends() {
        assert!(index.insert(Path::new("/x"), 1).unwrap());
        index
            .update_digest(Path::new("/x"), &Digest::Value("s-1".into()))
            .unwrap();
        assert!(!index.insert(Path::new("/x"), 99).unwrap(), "{name}");

        let records = scan(index.as_ref(), ScanOrder::BySize, 10);
        assert_eq!(records.len(), 1, "{name}");
        assert_eq!(records[0].size, 1, "{name}");
        assert_eq!(records[0].digest, Some(Digest::Value("s-1".into())), "{name}");
    }
}

#[test]
fn test_reset_discards_records_and_generation() {
    for (name, index) in backends() {
        populate(index.as_ref());
        index
            .complete_generation(&Generation::completed_now(Path::new("/"), 7))
            .unwrap();
        assert!(index.generation().unwrap().is_some(), "{name}");

        index.reset().unwrap();
        assert_eq!(index.count().unwrap(), 0, "{name}");
        assert!(index.generation().unwrap().is_none(), "{name}");
    }
}

#[test]
fn test_sqlite_index_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("nested").join("index.db");

    {
        let index = SqliteIndex::open(&db).unwrap();
        populate(&index);
        index
            .complete_generation(&Generation::completed_now(Path::new("/root"), 7))
            .unwrap();
    }

    let index = SqliteIndex::open(&db).unwrap();
    assert_eq!(index.location(), Some(db.as_path()));
    assert_eq!(index.count().unwrap(), 7);
    let generation = index.generation().unwrap().unwrap();
    assert_eq!(generation.root, PathBuf::from("/root"));
    assert_eq!(generation.files, 7);

    let records = scan(&index, ScanOrder::ByDigest, 2);
    assert_eq!(records[0].digest, Some(Digest::Value("s-aa".into())));
}

#[test]
fn test_sqlite_uncommitted_batch_is_flushed_on_drop() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("index.db");

    {
        let index = SqliteIndex::open(&db).unwrap().with_write_batch(1000);
        for i in 0..10 {
            index.insert(Path::new(&format!("/f{i}")), i).unwrap();
        }
    }

    let index = SqliteIndex::open(&db).unwrap();
    assert_eq!(index.count().unwrap(), 10);
}
