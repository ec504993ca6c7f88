//! End-to-end tests for `DiskStorage`: write/read cycles, conflict
//! truncation, snapshot install, file-count compaction, destroy with
//! backup, corrupt-tail recovery, and the leading-hole start.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tempfile::TempDir;

use raft_disklog::{DiskStorage, Entry, Options, SnapshotMeta, StorageError};

fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn random_entry(index: u64, payload: usize) -> Entry {
    let mut rng = rand::thread_rng();
    let mut data = vec![0u8; payload];
    rng.fill(&mut data[..]);
    Entry::new(index, rng.gen_range(1..=100), data)
}

/// Entries for `[lo, hi)` with random terms and payloads, the shape the
/// consensus layer would hand to `store_entries`.
fn random_entries(lo: u64, hi: u64, payload: usize) -> Vec<Entry> {
    (lo..hi).map(|i| random_entry(i, payload)).collect()
}

fn test_options() -> Options {
    Options {
        log_file_size: 1024,
        allow_corrupt_startup: true,
        ..Options::default()
    }
}

fn reopen(storage: DiskStorage, dir: &Path, opts: &Options) -> DiskStorage {
    storage.close().unwrap();
    drop(storage);
    let opts = Options {
        initial_first_index: 0,
        ..opts.clone()
    };
    DiskStorage::open(dir, opts).unwrap()
}

#[test]
fn test_write_and_read_back() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let opts = test_options();
    let storage = DiskStorage::open(tmp.path(), opts.clone()).unwrap();

    let written = random_entries(1, 100, 256);
    storage.store_entries(&written).unwrap();

    assert_eq!(storage.first_index().unwrap(), 1);
    assert_eq!(storage.last_index().unwrap(), 99);

    // One by one.
    for i in 1..100u64 {
        let ents = storage.entries(i, i + 1, u64::MAX).unwrap();
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0], written[(i - 1) as usize]);
    }

    // The whole range at once.
    let all = storage.entries(1, 100, u64::MAX).unwrap();
    assert_eq!(all, written);

    // Terms agree with what was written.
    for i in 1..100u64 {
        assert_eq!(storage.term(i).unwrap(), written[(i - 1) as usize].term);
    }

    // Byte-size cap: room for exactly the first two entries.
    let cap = written[0].byte_size() + written[1].byte_size();
    let capped = storage.entries(1, 100, cap).unwrap();
    assert_eq!(capped, written[..2]);

    // A cap below the first entry still returns it.
    let one = storage.entries(1, 100, 1).unwrap();
    assert_eq!(one, written[..1]);

    // Reads below the window are classified as compacted.
    let err = storage.entries(0, 100, u64::MAX).unwrap_err();
    assert!(err.is_compacted());

    // Everything survives a close/reopen cycle.
    let storage = reopen(storage, tmp.path(), &opts);
    assert_eq!(storage.first_index().unwrap(), 1);
    assert_eq!(storage.last_index().unwrap(), 99);
    assert_eq!(storage.entries(1, 100, u64::MAX).unwrap(), written);
    for i in 1..100u64 {
        assert_eq!(storage.term(i).unwrap(), written[(i - 1) as usize].term);
    }
    let capped = storage.entries(1, 100, cap).unwrap();
    assert_eq!(capped, written[..2]);
}

#[test]
fn test_conflict_truncation() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let storage = DiskStorage::open(tmp.path(), test_options()).unwrap();

    let written = random_entries(1, 100, 256);
    storage.store_entries(&written).unwrap();

    // A new leader overwrites from index 50.
    let conflict = random_entry(50, 256);
    storage.store_entries(std::slice::from_ref(&conflict)).unwrap();

    assert_eq!(storage.first_index().unwrap(), 1);
    assert_eq!(storage.last_index().unwrap(), 50);

    let mut expected: Vec<Entry> = written[..49].to_vec();
    expected.push(conflict);
    assert_eq!(storage.entries(1, 51, u64::MAX).unwrap(), expected);

    // The overwritten suffix is gone for good.
    assert!(matches!(
        storage.entries(1, 52, u64::MAX),
        Err(StorageError::OutOfBound { .. })
    ));
}

#[test]
fn test_apply_snapshot() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let storage = DiskStorage::open(tmp.path(), test_options()).unwrap();

    storage.store_entries(&random_entries(1, 100, 256)).unwrap();

    let mut rng = rand::thread_rng();
    let snap = SnapshotMeta {
        index: 100 + rng.gen_range(1..=1000),
        term: rng.gen_range(1..=100),
    };
    storage.apply_snapshot(snap).unwrap();

    assert_eq!(storage.first_index().unwrap(), snap.index + 1);
    assert_eq!(storage.last_index().unwrap(), snap.index);
    assert_eq!(storage.term(snap.index).unwrap(), snap.term);
    assert!(storage.term(snap.index - 20).unwrap_err().is_compacted());

    // The first append after the install starts right past the boundary.
    let e = random_entry(snap.index + 1, 256);
    storage.store_entries(std::slice::from_ref(&e)).unwrap();
    let got = storage
        .entries(snap.index + 1, snap.index + 2, u64::MAX)
        .unwrap();
    assert_eq!(got, vec![e]);
}

#[test]
fn test_compaction_keeps_file_count() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let opts = Options {
        max_log_files: 3,
        ..test_options()
    };
    let storage = DiskStorage::open(tmp.path(), opts.clone()).unwrap();

    storage.store_entries(&random_entries(1, 100, 256)).unwrap();
    storage.applied_to(99);

    let count = storage.files_count().unwrap();
    storage
        .store_entries(&[random_entry(100, 256)])
        .unwrap();
    let count2 = storage.files_count().unwrap();

    assert!(count2 < count);
    assert!(count2 >= 3);

    let first = storage.first_index().unwrap();
    assert!(first > 1, "compaction must advance the window");
    let ents = storage.entries(first, 101, u64::MAX).unwrap();
    assert_eq!(ents.last().unwrap().index, 100);

    // Identical sequence after reopen.
    let storage = reopen(storage, tmp.path(), &opts);
    assert_eq!(storage.first_index().unwrap(), first);
    let ents2 = storage.entries(first, 101, u64::MAX).unwrap();
    assert_eq!(ents, ents2);
}

#[test]
fn test_destroy() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("group");
    let storage = DiskStorage::open(&dir, test_options()).unwrap();
    storage.store_entries(&random_entries(1, 100, 256)).unwrap();

    storage.destroy(false).unwrap();
    assert!(
        matches!(fs::metadata(&dir), Err(e) if e.kind() == std::io::ErrorKind::NotFound),
        "directory must be gone after destroy"
    );
}

#[test]
fn test_destroy_with_backup() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("group");
    let storage = DiskStorage::open(&dir, test_options()).unwrap();

    let written = random_entries(1, 100, 256);
    storage.store_entries(&written).unwrap();

    let start = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    storage.destroy(true).unwrap();
    let end = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();

    assert!(matches!(fs::metadata(&dir), Err(e) if e.kind() == std::io::ErrorKind::NotFound));

    // Locate the backup directory stamped within the destroy window.
    let mut bak_path = None;
    for t in start..=end {
        let candidate = PathBuf::from(format!("{}.bak.{}", dir.display(), t));
        if candidate.exists() {
            bak_path = Some(candidate);
            break;
        }
    }
    let bak_path = bak_path.expect("backup directory exists");

    // The backup is a fully functional storage directory.
    let restored = DiskStorage::open(&bak_path, Options::default()).unwrap();
    assert_eq!(restored.entries(1, 100, u64::MAX).unwrap(), written);
}

// The corruption injectors exist only in debug builds, matching how the
// original test suite gates its corruption cases.
#[cfg(debug_assertions)]
#[test]
fn test_garbage_tail_is_dropped_without_data_loss() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let opts = test_options();
    let storage = DiskStorage::open(tmp.path(), opts.clone()).unwrap();

    let mut written = random_entries(1, 100, 256);
    storage.store_entries(&written).unwrap();

    // A torn write leaves garbage after the last durable record.
    storage.inject_garbage_tail().unwrap();

    // Reads are unaffected while the in-memory index is intact.
    assert_eq!(storage.entries(1, 100, u64::MAX).unwrap(), written);

    let storage = reopen(storage, tmp.path(), &opts);
    assert_eq!(storage.first_index().unwrap(), 1);
    assert_eq!(storage.last_index().unwrap(), 99);
    assert_eq!(storage.entries(1, 100, u64::MAX).unwrap(), written);

    // Appends continue seamlessly.
    let more = random_entries(100, 110, 256);
    storage.store_entries(&more).unwrap();
    written.extend(more);
    assert_eq!(storage.entries(1, 110, u64::MAX).unwrap(), written);
}

#[cfg(debug_assertions)]
#[test]
fn test_corrupt_tail_recovery() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let opts = test_options();
    let storage = DiskStorage::open(tmp.path(), opts.clone()).unwrap();

    let mut written = random_entries(1, 100, 256);
    storage.store_entries(&written).unwrap();

    // Damage the last record of the active segment, then restart.
    storage.inject_tail_corruption().unwrap();
    let storage = reopen(storage, tmp.path(), &opts);

    assert_eq!(storage.first_index().unwrap(), 1);
    let last = storage.last_index().unwrap();
    assert!((1..=98).contains(&last), "tail dropped, bounded loss: {}", last);

    // Entries up to the recovered tail read back identical.
    written.truncate(last as usize);
    assert_eq!(storage.entries(1, last + 1, u64::MAX).unwrap(), written);

    // The log accepts appends at the new tail.
    let more = random_entries(last + 1, last + 11, 256);
    storage.store_entries(&more).unwrap();
    written.extend(more);
    assert_eq!(
        storage.entries(1, last + 11, u64::MAX).unwrap(),
        written
    );
}

#[cfg(debug_assertions)]
#[test]
fn test_corrupt_tail_strict_mode_fails_open() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let opts = test_options();
    let storage = DiskStorage::open(tmp.path(), opts.clone()).unwrap();
    storage.store_entries(&random_entries(1, 100, 256)).unwrap();

    storage.inject_tail_corruption().unwrap();
    storage.close().unwrap();
    drop(storage);

    let strict = Options {
        allow_corrupt_startup: false,
        ..opts
    };
    let err = DiskStorage::open(tmp.path(), strict).unwrap_err();
    assert!(matches!(err, StorageError::Corrupt { .. }));
}

#[test]
fn test_start_with_hole() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let opts = Options {
        initial_first_index: 100,
        ..test_options()
    };
    let storage = DiskStorage::open(tmp.path(), opts.clone()).unwrap();

    assert_eq!(storage.first_index().unwrap(), 100);
    assert_eq!(storage.last_index().unwrap(), 99);
    assert!(storage
        .entries(99, 200, u64::MAX)
        .unwrap_err()
        .is_compacted());

    let written = random_entries(100, 200, 256);
    storage.store_entries(&written).unwrap();

    assert_eq!(storage.first_index().unwrap(), 100);
    assert_eq!(storage.last_index().unwrap(), 199);
    assert_eq!(storage.entries(100, 200, u64::MAX).unwrap(), written);

    for i in 100..200u64 {
        assert_eq!(storage.term(i).unwrap(), written[(i - 100) as usize].term);
    }

    let cap = written[0].byte_size() + written[1].byte_size();
    assert_eq!(storage.entries(100, 200, cap).unwrap(), written[..2]);
    assert_eq!(storage.entries(100, 200, 1).unwrap(), written[..1]);

    let err = storage.entries(0, 200, u64::MAX).unwrap_err();
    assert!(err.is_compacted());

    // Reopening without the option keeps the shifted window.
    let storage = reopen(storage, tmp.path(), &opts);
    assert_eq!(storage.first_index().unwrap(), 100);
    assert_eq!(storage.last_index().unwrap(), 199);
    assert_eq!(storage.entries(100, 200, u64::MAX).unwrap(), written);
}
