//! `DiskStorage`: the storage façade the Raft core drives.
//!
//! Owns the segmented [`Log`] plus the small meta file carrying hard state
//! and the truncation/applied watermarks. All mutating calls are serialized
//! by the owning Raft worker; a reader/writer lock lets lookups run
//! concurrently with each other.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::entry::Entry;
use crate::error::{StorageError, StorageResult};
use crate::lock::DirLock;
use crate::log::{Log, LogOptions};
use crate::log_file::parse_segment_file_name;
use crate::meta::{HardState, Meta, TruncateMeta};

/// When appended data is pushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every file write.
    Always,
    /// fsync once per `store_entries` batch.
    Batch,
    /// Leave durability to the OS page cache.
    Off,
}

/// Open options for [`DiskStorage`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Target segment size in bytes; a record that does not fit rolls the
    /// log over to a fresh segment.
    pub log_file_size: u64,
    /// Compaction target: retire oldest applied segments once the file
    /// count exceeds this. `usize::MAX` disables compaction.
    pub max_log_files: usize,
    /// Tolerate a corrupt tail or broken segment adjacency at startup by
    /// truncating, instead of failing the open.
    pub allow_corrupt_startup: bool,
    /// When opening an empty directory, initialize the log as if a snapshot
    /// at `initial_first_index - 1` had been applied. Zero means unset.
    pub initial_first_index: u64,
    pub fsync_policy: FsyncPolicy,
    /// Entries kept in the in-memory tail cache.
    pub cache_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_file_size: 16 * 1024 * 1024,
            max_log_files: usize::MAX,
            allow_corrupt_startup: false,
            initial_first_index: 0,
            fsync_policy: FsyncPolicy::Batch,
            cache_entries: 256,
        }
    }
}

/// Metadata of an installed snapshot: the last entry it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
}

/// Point-in-time disk usage of one storage instance.
#[derive(Debug, Clone)]
pub struct DiskStats {
    pub files_count: usize,
    pub active_bytes: u64,
    pub sealed_bytes: u64,
    pub total_bytes: u64,
    pub log_file_size: u64,
}

struct Inner {
    log: Log,
    meta: Meta,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Durable log storage for a single Raft replica group.
///
/// Exactly one instance may own a directory at a time, enforced by an
/// advisory `LOCK` file.
pub struct DiskStorage {
    dir: PathBuf,
    opts: Options,
    inner: RwLock<Inner>,
    _dir_lock: DirLock,
}

impl std::fmt::Debug for DiskStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStorage").field("dir", &self.dir).finish_non_exhaustive()
    }
}

fn has_segments(dir: &Path) -> StorageResult<bool> {
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if parse_segment_file_name(name).is_some() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

impl DiskStorage {
    /// Open (or create) the storage rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, opts: Options) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let dir_lock = DirLock::acquire(&dir)?;

        let (mut meta, meta_existed) = Meta::load(&dir, opts.allow_corrupt_startup)?;

        // A fresh directory may start with a hole in front: behave as if a
        // snapshot at `initial_first_index - 1` was already applied.
        if opts.initial_first_index > 0 && !meta_existed && !has_segments(&dir)? {
            meta.truncated = TruncateMeta {
                index: opts.initial_first_index - 1,
                term: 0,
            };
            meta.persist(&dir)?;
            info!(
                first_index = opts.initial_first_index,
                "initialized empty storage with leading hole"
            );
        }

        let (log, report) = Log::open(
            &dir,
            meta.truncated,
            LogOptions {
                log_file_size: opts.log_file_size,
                allow_corrupt_startup: opts.allow_corrupt_startup,
                fsync_policy: opts.fsync_policy,
                cache_entries: opts.cache_entries,
            },
        )?;

        if report.truncated_adjusted {
            meta.truncated = log.truncated();
            meta.persist(&dir)?;
        }
        if report.recovered {
            warn!(dir = %dir.display(), "storage recovered from a corrupt tail at startup");
        }

        info!(
            dir = %dir.display(),
            first_index = log.first_index(),
            last_index = log.last_index(),
            files = log.files_count(),
            "disk storage opened"
        );

        Ok(Self {
            dir,
            opts,
            inner: RwLock::new(Inner {
                log,
                meta,
                closed: false,
            }),
            _dir_lock: dir_lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn first_index(&self) -> StorageResult<u64> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.log.first_index())
    }

    pub fn last_index(&self) -> StorageResult<u64> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.log.last_index())
    }

    /// Term of the entry at `index`, or of the snapshot boundary itself.
    pub fn term(&self, index: u64) -> StorageResult<u64> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner.log.term(index)
    }

    /// Read entries in `[lo, hi)` subject to the `max_size` payload cap.
    pub fn entries(&self, lo: u64, hi: u64, max_size: u64) -> StorageResult<Vec<Entry>> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner.log.entries(lo, hi, max_size)
    }

    /// Number of log files currently on disk (sealed plus active).
    pub fn files_count(&self) -> StorageResult<usize> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.log.files_count())
    }

    /// Durably append a contiguous batch, overwriting any conflicting
    /// suffix, then compact by file count if the applied watermark allows.
    pub fn store_entries(&self, entries: &[Entry]) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.log.store_entries(entries)?;
        self.maybe_compact(&mut inner)
    }

    /// Retire oldest sealed segments while more than `max_log_files` are on
    /// disk, never compacting past the applied index. The truncation meta
    /// is persisted before each file is unlinked.
    fn maybe_compact(&self, inner: &mut Inner) -> StorageResult<()> {
        while inner.log.files_count() > self.opts.max_log_files {
            let Some(oldest_last) = inner.log.oldest_sealed_last_index() else {
                break;
            };
            if oldest_last > inner.meta.applied_index {
                break;
            }
            let term = inner.log.term(oldest_last)?;
            let t = TruncateMeta {
                index: oldest_last,
                term,
            };
            inner.meta.truncated = t;
            inner.meta.persist(&self.dir)?;
            inner.log.truncate_prefix(t)?;
            info!(
                truncated = t.index,
                files = inner.log.files_count(),
                "compacted oldest log file"
            );
        }
        Ok(())
    }

    /// Install a snapshot boundary: persist the new truncation meta, retire
    /// every log file, and restart the tail at `meta.index + 1`.
    pub fn apply_snapshot(&self, snap: SnapshotMeta) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;

        let t = TruncateMeta {
            index: snap.index,
            term: snap.term,
        };
        inner.meta.truncated = t;
        if inner.meta.applied_index < snap.index {
            inner.meta.applied_index = snap.index;
        }
        // Meta first: the files below are unreachable only once the
        // truncation point is durable.
        inner.meta.persist(&self.dir)?;
        inner.log.reset_to_snapshot(t)?;

        info!(index = snap.index, term = snap.term, "snapshot applied");
        Ok(())
    }

    /// Advance the applied watermark. In-memory only; it is persisted with
    /// the next meta rewrite.
    pub fn applied_to(&self, index: u64) {
        let mut inner = self.inner.write();
        if index > inner.meta.applied_index {
            inner.meta.applied_index = index;
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.read().meta.applied_index
    }

    pub fn hard_state(&self) -> StorageResult<HardState> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.meta.hard_state)
    }

    /// Persist a new hard state via the atomic meta rewrite.
    pub fn set_hard_state(&self, hs: HardState) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.meta.hard_state = hs;
        inner.meta.persist(&self.dir)
    }

    pub fn stats(&self) -> StorageResult<DiskStats> {
        let inner = self.inner.read();
        inner.check_open()?;
        let active_bytes = inner.log.active_bytes();
        let sealed_bytes = inner.log.sealed_bytes();
        Ok(DiskStats {
            files_count: inner.log.files_count(),
            active_bytes,
            sealed_bytes,
            total_bytes: active_bytes + sealed_bytes,
            log_file_size: self.opts.log_file_size,
        })
    }

    /// Flush and sync the tail, persist the meta (including the applied
    /// watermark), and refuse further operations. Idempotent.
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.log.flush(true)?;
        inner.meta.persist(&self.dir)?;
        inner.closed = true;
        info!(dir = %self.dir.display(), "disk storage closed");
        Ok(())
    }

    /// Tear the storage down. With `backup` the directory is renamed to
    /// `<dir>.bak.<unix_seconds>` (a counter suffix resolves collisions);
    /// otherwise it is removed recursively.
    pub fn destroy(self, backup: bool) -> StorageResult<()> {
        {
            let mut inner = self.inner.write();
            if !inner.closed {
                inner.log.flush(true)?;
                inner.closed = true;
            }
        }

        if backup {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(std::io::Error::other)?
                .as_secs();
            let base = format!("{}.bak.{}", self.dir.display(), secs);
            let mut target = PathBuf::from(&base);
            let mut n = 0u32;
            while target.exists() {
                n += 1;
                target = PathBuf::from(format!("{}.{}", base, n));
            }
            fs::rename(&self.dir, &target)?;
            info!(from = %self.dir.display(), to = %target.display(), "storage moved to backup");
        } else {
            fs::remove_dir_all(&self.dir)?;
            info!(dir = %self.dir.display(), "storage destroyed");
        }
        Ok(())
    }
}

/// Corruption injectors mirroring crash damage on the tail segment.
/// Compiled into debug builds; the `fault-injection` feature keeps them
/// available in release builds.
#[cfg(any(test, debug_assertions, feature = "fault-injection"))]
impl DiskStorage {
    /// Append a garbage block after the last durable record, as a torn
    /// write would.
    pub fn inject_garbage_tail(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.log.active_file_mut().append_garbage(64)
    }

    /// Flip bytes inside the last record of the active segment.
    pub fn inject_tail_corruption(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        if inner.log.active_file_mut().is_empty() {
            warn!("active segment empty, nothing to corrupt");
            return Ok(());
        }
        inner.log.active_file_mut().corrupt_last_record()
    }
}
