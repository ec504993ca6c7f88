//! The ordered collection of log segments backing one replica group.
//!
//! A `Log` owns zero or more sealed segments followed by exactly one active
//! (writable) tail segment. Adjacent segments are contiguous in index space:
//! each file's first index is its predecessor's last index plus one.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::entry::{encode_record, Entry};
use crate::error::{StorageError, StorageResult};
use crate::log_file::{parse_segment_file_name, LogFile};
use crate::meta::TruncateMeta;
use crate::storage::FsyncPolicy;

#[derive(Debug)]
pub(crate) struct LogOptions {
    pub log_file_size: u64,
    pub allow_corrupt_startup: bool,
    pub fsync_policy: FsyncPolicy,
    pub cache_entries: usize,
}

/// Bounded cache of the newest entries, serving `term` and `entries` hits
/// without touching segment files.
#[derive(Debug)]
struct EntryCache {
    entries: VecDeque<Entry>,
    cap: usize,
}

impl EntryCache {
    fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    fn push(&mut self, entry: Entry) {
        if self.cap == 0 {
            return;
        }
        debug_assert!(self
            .entries
            .back()
            .map_or(true, |b| b.index + 1 == entry.index));
        self.entries.push_back(entry);
        if self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    fn get(&self, index: u64) -> Option<&Entry> {
        let first = self.entries.front()?.index;
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Drop cached entries with `index >= k`.
    fn truncate_suffix(&mut self, k: u64) {
        while self.entries.back().is_some_and(|b| b.index >= k) {
            self.entries.pop_back();
        }
    }

    /// Drop cached entries with `index <= t`.
    fn truncate_prefix(&mut self, t: u64) {
        while self.entries.front().is_some_and(|f| f.index <= t) {
            self.entries.pop_front();
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What `Log::open` had to do to bring the directory up.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct OpenReport {
    /// A corrupt tail or broken adjacency was repaired by dropping data.
    pub recovered: bool,
    /// The truncation point was reconstructed from the files on disk and
    /// should be persisted back to the meta file.
    pub truncated_adjusted: bool,
}

#[derive(Debug)]
pub(crate) struct Log {
    dir: PathBuf,
    opts: LogOptions,
    sealed: Vec<LogFile>,
    active: LogFile,
    truncated: TruncateMeta,
    next_seq: u64,
    cache: EntryCache,
}

impl Log {
    /// Scan `dir`, open every segment in sequence order, repair what the
    /// options allow, and set up the active tail.
    pub fn open(dir: &Path, truncated: TruncateMeta, opts: LogOptions) -> StorageResult<(Self, OpenReport)> {
        let mut report = OpenReport::default();
        let mut truncated = truncated;

        let mut names: Vec<(u64, u64, PathBuf)> = Vec::new();
        for dirent in fs::read_dir(dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some((seq, first)) = parse_segment_file_name(name) {
                    names.push((seq, first, path));
                }
            }
        }
        names.sort_by_key(|(seq, _, _)| *seq);

        let mut opened: Vec<LogFile> = Vec::new();
        for (i, (seq, first, path)) in names.iter().enumerate() {
            let is_last = i + 1 == names.len();

            // Adjacency with the previous file must hold before we bother
            // opening this one.
            if let Some(prev) = opened.last() {
                if *first != prev.next_index() {
                    if !opts.allow_corrupt_startup {
                        return Err(StorageError::corrupt(
                            path,
                            0,
                            format!(
                                "segment starts at {} but predecessor ends at {}",
                                first,
                                prev.next_index() - 1
                            ),
                        ));
                    }
                    warn!(
                        path = %path.display(),
                        expected = prev.next_index(),
                        found = first,
                        "segment adjacency broken, dropping this and later segments"
                    );
                    Self::unlink_segments(&names[i..]);
                    report.recovered = true;
                    break;
                }
            }

            let result = LogFile::open(path.clone(), *seq, *first, opts.allow_corrupt_startup)?;
            report.recovered |= result.recovered;
            let mut lf = result.file;

            if !is_last {
                if lf.is_empty() {
                    // A middle segment with no surviving records cannot be
                    // adjacent to anything after it.
                    if !opts.allow_corrupt_startup {
                        return Err(StorageError::corrupt(path, 0, "empty mid-sequence segment"));
                    }
                    warn!(path = %path.display(), "empty mid-sequence segment, dropping it and later segments");
                    lf.retire()?;
                    Self::unlink_segments(&names[i + 1..]);
                    report.recovered = true;
                    break;
                }
                if !lf.is_sealed() {
                    // Footer lost in a crash mid-rotation; restore it so
                    // every non-tail segment is sealed again.
                    warn!(path = %path.display(), "unsealed mid-sequence segment, resealing");
                    lf.seal()?;
                }
            }
            opened.push(lf);
        }

        // If the snapshot point lies before the oldest entry on disk there
        // is a hole the log cannot serve. Reconstruct the truncation point
        // from the files when tolerated.
        if let Some(first_file) = opened.first() {
            if truncated.index + 1 < first_file.first_index() {
                if !opts.allow_corrupt_startup {
                    return Err(StorageError::corrupt(
                        first_file.path(),
                        0,
                        format!(
                            "log starts at {} but meta claims truncation at {}",
                            first_file.first_index(),
                            truncated.index
                        ),
                    ));
                }
                warn!(
                    meta_truncated = truncated.index,
                    log_first = first_file.first_index(),
                    "meta truncation behind log start, adopting log boundary"
                );
                truncated = TruncateMeta {
                    index: first_file.first_index() - 1,
                    term: 0,
                };
                report.truncated_adjusted = true;
            }
        }

        // Drop whole files already covered by the snapshot.
        let mut sealed = opened;
        let fully_compacted = sealed
            .last()
            .is_some_and(|f| f.last_index().is_some_and(|l| l <= truncated.index));
        if fully_compacted {
            info!(truncated = truncated.index, "all segments below snapshot, starting fresh");
            let next_seq = sealed.last().map_or(1, |f| f.seq() + 1);
            for f in sealed.drain(..) {
                f.retire()?;
            }
            let active = LogFile::create(dir, next_seq, truncated.index + 1)?;
            let cache = EntryCache::new(opts.cache_entries);
            return Ok((
                Self {
                    dir: dir.to_path_buf(),
                    opts,
                    sealed: Vec::new(),
                    active,
                    truncated,
                    next_seq: next_seq + 1,
                    cache,
                },
                report,
            ));
        }
        while sealed
            .first()
            .is_some_and(|f| f.last_index().is_some_and(|l| l <= truncated.index))
            && sealed.len() > 1
        {
            sealed.remove(0).retire()?;
        }

        // The last file becomes the active tail if it is still writable;
        // otherwise roll a fresh one after it.
        let (active, next_seq) = match sealed.last() {
            Some(last) if !last.is_sealed() => {
                let active = sealed.pop().expect("checked non-empty");
                let next_seq = active.seq() + 1;
                (active, next_seq)
            }
            Some(last) => {
                let seq = last.seq() + 1;
                let first = last.next_index();
                (LogFile::create(dir, seq, first)?, seq + 1)
            }
            None => (LogFile::create(dir, 1, truncated.index + 1)?, 2),
        };

        // A crash between persisting snapshot meta and resetting the files
        // can leave an empty tail seeded before the new window; restart it.
        let (active, next_seq) = if active.is_empty()
            && sealed.is_empty()
            && active.first_index() != truncated.index + 1
        {
            warn!(
                tail_first = active.first_index(),
                window_first = truncated.index + 1,
                "empty tail behind the index window, reseeding"
            );
            active.retire()?;
            (
                LogFile::create(dir, next_seq, truncated.index + 1)?,
                next_seq + 1,
            )
        } else {
            (active, next_seq)
        };

        info!(
            first_index = truncated.index + 1,
            sealed = sealed.len(),
            active_first = active.first_index(),
            "log opened"
        );

        let cache = EntryCache::new(opts.cache_entries);
        Ok((
            Self {
                dir: dir.to_path_buf(),
                opts,
                sealed,
                active,
                truncated,
                next_seq,
                cache,
            },
            report,
        ))
    }

    fn unlink_segments(names: &[(u64, u64, PathBuf)]) {
        for (_, _, path) in names {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), "failed to unlink dropped segment: {}", e);
            }
            let idx = path.with_extension(crate::log_file::SIDECAR_EXT);
            match fs::remove_file(&idx) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %idx.display(), "failed to unlink sidecar: {}", e),
            }
        }
    }

    pub fn first_index(&self) -> u64 {
        self.truncated.index + 1
    }

    pub fn last_index(&self) -> u64 {
        if let Some(last) = self.active.last_index() {
            last
        } else if let Some(f) = self.sealed.last() {
            f.last_index().expect("sealed segments are never empty")
        } else {
            self.truncated.index
        }
    }

    pub fn truncated(&self) -> TruncateMeta {
        self.truncated
    }

    pub fn files_count(&self) -> usize {
        self.sealed.len() + 1
    }

    pub fn term(&self, index: u64) -> StorageResult<u64> {
        if index == self.truncated.index {
            return Ok(self.truncated.term);
        }
        if index < self.truncated.index {
            return Err(StorageError::Compacted {
                index,
                first_index: self.first_index(),
            });
        }
        let last = self.last_index();
        if index > last {
            return Err(StorageError::OutOfBound {
                index,
                last_index: last,
            });
        }
        if let Some(e) = self.cache.get(index) {
            return Ok(e.term);
        }
        self.read_entry(index).map(|(e, _)| e.term)
    }

    /// Read `[lo, hi)`, capping the cumulative serialized payload size at
    /// `max_size` but always returning the first entry of the range.
    pub fn entries(&self, lo: u64, hi: u64, max_size: u64) -> StorageResult<Vec<Entry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let first_index = self.first_index();
        if lo < first_index {
            return Err(StorageError::Compacted {
                index: lo,
                first_index,
            });
        }
        let last = self.last_index();
        if hi > last + 1 {
            return Err(StorageError::OutOfBound {
                index: hi - 1,
                last_index: last,
            });
        }

        let mut out = Vec::with_capacity((hi - lo).min(1024) as usize);
        let mut total = 0u64;
        for index in lo..hi {
            let (entry, size) = match self.cache.get(index) {
                Some(e) => (e.clone(), e.byte_size()),
                None => self.read_entry(index)?,
            };
            if !out.is_empty() && total.saturating_add(size) > max_size {
                break;
            }
            total = total.saturating_add(size);
            out.push(entry);
        }
        Ok(out)
    }

    /// Append a contiguous batch, overwriting any conflicting suffix.
    pub fn store_entries(&mut self, entries: &[Entry]) -> StorageResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        for (k, e) in entries.iter().enumerate() {
            let expected = first.index + k as u64;
            if e.index != expected {
                return Err(StorageError::Gap {
                    expected,
                    got: e.index,
                });
            }
        }

        let lo = first.index;
        let first_index = self.first_index();
        let last = self.last_index();
        if lo < first_index {
            return Err(StorageError::Compacted {
                index: lo,
                first_index,
            });
        }
        if lo > last + 1 {
            return Err(StorageError::Gap {
                expected: last + 1,
                got: lo,
            });
        }
        if lo <= last {
            // A new leader is overwriting an uncommitted tail.
            info!(from = lo, old_last = last, "conflict truncation before append");
            self.truncate_suffix(lo)?;
        }
        debug_assert_eq!(lo, self.last_index() + 1);

        for e in entries {
            let frame = encode_record(e)?;
            if !self.active.append(e.index, &frame, self.opts.log_file_size) {
                self.roll()?;
                let appended = self.active.append(e.index, &frame, self.opts.log_file_size);
                debug_assert!(appended, "fresh segment accepts any record");
            }
            if self.opts.fsync_policy == FsyncPolicy::Always {
                self.active.flush(true)?;
            }
        }
        self.active.flush(self.opts.fsync_policy != FsyncPolicy::Off)?;

        for e in entries {
            self.cache.push(e.clone());
        }
        Ok(())
    }

    /// Seal the active tail and start a fresh segment after it.
    fn roll(&mut self) -> StorageResult<()> {
        debug_assert!(!self.active.is_empty(), "never roll an empty tail");
        let next_first = self.active.next_index();
        let fresh = LogFile::create(&self.dir, self.next_seq, next_first)?;
        self.next_seq += 1;

        let mut old = std::mem::replace(&mut self.active, fresh);
        old.seal()?;
        self.sealed.push(old);
        Ok(())
    }

    /// Drop every entry with `index >= k`. Retires segments that lie wholly
    /// above `k`, reopening the newest surviving segment as the tail.
    pub fn truncate_suffix(&mut self, k: u64) -> StorageResult<()> {
        if k > self.last_index() {
            return Ok(());
        }
        if k <= self.truncated.index {
            return Err(StorageError::Compacted {
                index: k,
                first_index: self.first_index(),
            });
        }
        self.cache.truncate_suffix(k);

        while self.active.first_index() > k {
            if let Some(mut prev) = self.sealed.pop() {
                prev.unseal()?;
                let old = std::mem::replace(&mut self.active, prev);
                old.retire()?;
            } else {
                // The truncation wipes the whole log; restart the tail at k.
                let fresh = LogFile::create(&self.dir, self.next_seq, k)?;
                self.next_seq += 1;
                let old = std::mem::replace(&mut self.active, fresh);
                old.retire()?;
                break;
            }
        }
        self.active.truncate_suffix(k)
    }

    /// Record a new truncation point and retire every sealed segment that
    /// now lies entirely below it. Segments straddling the point are kept;
    /// their covered entries become unreachable via the index window.
    pub fn truncate_prefix(&mut self, t: TruncateMeta) -> StorageResult<()> {
        if t.index <= self.truncated.index {
            return Ok(());
        }
        self.truncated = t;
        self.cache.truncate_prefix(t.index);
        while self
            .sealed
            .first()
            .is_some_and(|f| f.last_index().is_some_and(|l| l <= t.index))
        {
            self.sealed.remove(0).retire()?;
        }
        Ok(())
    }

    /// Snapshot install: every existing segment is obsolete. Retire them
    /// all and restart the tail just past the snapshot.
    pub fn reset_to_snapshot(&mut self, t: TruncateMeta) -> StorageResult<()> {
        self.truncated = t;
        self.cache.clear();
        for f in self.sealed.drain(..) {
            f.retire()?;
        }
        let fresh = LogFile::create(&self.dir, self.next_seq, t.index + 1)?;
        self.next_seq += 1;
        let old = std::mem::replace(&mut self.active, fresh);
        old.retire()?;
        info!(index = t.index, term = t.term, "log reset to snapshot");
        Ok(())
    }

    /// Oldest sealed segment's last index, if any (compaction candidate).
    pub fn oldest_sealed_last_index(&self) -> Option<u64> {
        self.sealed.first().and_then(|f| f.last_index())
    }

    pub fn flush(&mut self, sync: bool) -> StorageResult<()> {
        self.active.flush(sync)
    }

    pub fn sealed_bytes(&self) -> u64 {
        self.sealed.iter().map(|f| f.size()).sum()
    }

    pub fn active_bytes(&self) -> u64 {
        self.active.size()
    }

    fn read_entry(&self, index: u64) -> StorageResult<(Entry, u64)> {
        self.locate(index).read_entry(index)
    }

    /// Segment holding `index`. Callers have already window-checked.
    fn locate(&self, index: u64) -> &LogFile {
        if index >= self.active.first_index() {
            &self.active
        } else {
            let pos = self.sealed.partition_point(|f| f.first_index() <= index);
            &self.sealed[pos - 1]
        }
    }

    #[cfg(any(test, debug_assertions, feature = "fault-injection"))]
    pub fn active_file_mut(&mut self) -> &mut LogFile {
        &mut self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> Entry {
        Entry::new(index, term, vec![0u8; 64])
    }

    fn batch(lo: u64, hi: u64, term: u64) -> Vec<Entry> {
        (lo..hi).map(|i| entry(i, term)).collect()
    }

    fn small_opts() -> LogOptions {
        LogOptions {
            log_file_size: 512,
            allow_corrupt_startup: true,
            fsync_policy: FsyncPolicy::Batch,
            cache_entries: 16,
        }
    }

    fn open(dir: &Path, truncated: TruncateMeta) -> Log {
        Log::open(dir, truncated, small_opts()).unwrap().0
    }

    #[test]
    fn test_append_rolls_segments() {
        let dir = TempDir::new().unwrap();
        let mut log = open(dir.path(), TruncateMeta::default());

        log.store_entries(&batch(1, 50, 1)).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 49);
        assert!(log.files_count() > 1, "512-byte segments must roll");

        for i in 1..50 {
            assert_eq!(log.term(i).unwrap(), 1);
        }
        let all = log.entries(1, 50, u64::MAX).unwrap();
        assert_eq!(all.len(), 49);
        assert!(all.iter().enumerate().all(|(k, e)| e.index == k as u64 + 1));
    }

    #[test]
    fn test_window_checks() {
        let dir = TempDir::new().unwrap();
        let mut log = open(dir.path(), TruncateMeta::default());
        log.store_entries(&batch(1, 10, 1)).unwrap();

        assert!(matches!(
            log.entries(0, 10, u64::MAX),
            Err(StorageError::Compacted { .. })
        ));
        assert!(matches!(
            log.entries(1, 12, u64::MAX),
            Err(StorageError::OutOfBound { .. })
        ));
        assert!(matches!(
            log.term(10),
            Err(StorageError::OutOfBound { .. })
        ));
        assert_eq!(log.term(0).unwrap(), 0); // truncated.term
        assert!(matches!(
            log.store_entries(&batch(12, 14, 1)),
            Err(StorageError::Gap { .. })
        ));
    }

    #[test]
    fn test_max_size_cap_returns_prefix() {
        let dir = TempDir::new().unwrap();
        let mut log = open(dir.path(), TruncateMeta::default());
        let entries = batch(1, 10, 1);
        log.store_entries(&entries).unwrap();

        let two = entries[0].byte_size() + entries[1].byte_size();
        let got = log.entries(1, 10, two).unwrap();
        assert_eq!(got.len(), 2);

        // At least one entry even when the cap is tiny.
        let got = log.entries(1, 10, 1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].index, 1);
    }

    #[test]
    fn test_conflict_truncation_within_active() {
        let dir = TempDir::new().unwrap();
        let mut log = open(dir.path(), TruncateMeta::default());
        log.store_entries(&batch(1, 10, 1)).unwrap();

        log.store_entries(&[entry(5, 2)]).unwrap();
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term(5).unwrap(), 2);
        assert_eq!(log.term(4).unwrap(), 1);
        assert!(matches!(log.term(6), Err(StorageError::OutOfBound { .. })));
    }

    #[test]
    fn test_conflict_truncation_across_segments() {
        let dir = TempDir::new().unwrap();
        let mut log = open(dir.path(), TruncateMeta::default());
        log.store_entries(&batch(1, 50, 1)).unwrap();
        let files_before = log.files_count();
        assert!(files_before > 2);

        // Overwrite from index 10, which lives in an early segment.
        log.store_entries(&batch(10, 12, 3)).unwrap();
        assert_eq!(log.last_index(), 11);
        assert!(log.files_count() < files_before);
        assert_eq!(log.term(9).unwrap(), 1);
        assert_eq!(log.term(10).unwrap(), 3);

        let all = log.entries(1, 12, u64::MAX).unwrap();
        assert_eq!(all.len(), 11);
    }

    #[test]
    fn test_truncate_prefix_retires_covered_segments() {
        let dir = TempDir::new().unwrap();
        let mut log = open(dir.path(), TruncateMeta::default());
        log.store_entries(&batch(1, 50, 1)).unwrap();
        let files_before = log.files_count();

        let cut = log.oldest_sealed_last_index().unwrap();
        log.truncate_prefix(TruncateMeta {
            index: cut,
            term: 1,
        })
        .unwrap();
        assert_eq!(log.first_index(), cut + 1);
        assert_eq!(log.files_count(), files_before - 1);
        assert!(matches!(
            log.entries(cut, 50, u64::MAX),
            Err(StorageError::Compacted { .. })
        ));
        let rest = log.entries(cut + 1, 50, u64::MAX).unwrap();
        assert_eq!(rest.len(), (49 - cut) as usize);
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let dir = TempDir::new().unwrap();
        let written = batch(1, 40, 2);
        {
            let mut log = open(dir.path(), TruncateMeta::default());
            log.store_entries(&written).unwrap();
            log.flush(true).unwrap();
        }
        let log = open(dir.path(), TruncateMeta::default());
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 39);
        assert_eq!(log.entries(1, 40, u64::MAX).unwrap(), written);
    }

    #[test]
    fn test_reopen_after_sealed_tail_starts_new_active() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(dir.path(), TruncateMeta::default());
            log.store_entries(&batch(1, 5, 1)).unwrap();
            // Force the tail sealed, as if the process died mid-rotation
            // right after sealing.
            log.roll().unwrap();
            log.flush(true).unwrap();
        }
        let mut log = open(dir.path(), TruncateMeta::default());
        assert_eq!(log.last_index(), 4);
        log.store_entries(&[entry(5, 1)]).unwrap();
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn test_empty_log_first_append_after_hole() {
        let dir = TempDir::new().unwrap();
        let truncated = TruncateMeta { index: 99, term: 0 };
        let mut log = open(dir.path(), truncated);
        assert_eq!(log.first_index(), 100);
        assert_eq!(log.last_index(), 99);

        // Appends below or past the window are rejected.
        assert!(matches!(
            log.store_entries(&batch(50, 52, 1)),
            Err(StorageError::Compacted { .. })
        ));
        assert!(matches!(
            log.store_entries(&batch(101, 103, 1)),
            Err(StorageError::Gap { .. })
        ));

        log.store_entries(&batch(100, 110, 1)).unwrap();
        assert_eq!(log.last_index(), 109);
    }

    #[test]
    fn test_adjacency_break_drops_later_segments() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(dir.path(), TruncateMeta::default());
            log.store_entries(&batch(1, 50, 1)).unwrap();
            log.flush(true).unwrap();
        }
        // Remove a middle segment to break adjacency.
        let mut segs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|d| {
                let p = d.unwrap().path();
                parse_segment_file_name(p.file_name()?.to_str()?).map(|(seq, _)| (seq, p))
            })
            .collect();
        segs.sort_by_key(|(seq, _)| *seq);
        assert!(segs.len() >= 3);
        fs::remove_file(&segs[1].1).unwrap();

        let (log, report) = Log::open(dir.path(), TruncateMeta::default(), small_opts()).unwrap();
        assert!(report.recovered);
        // Only the first segment survives.
        let survive_last = log.last_index();
        assert!(survive_last < 49);
        let got = log.entries(1, survive_last + 1, u64::MAX).unwrap();
        assert_eq!(got.len(), survive_last as usize);
    }

    #[test]
    fn test_adjacency_break_strict_fails() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(dir.path(), TruncateMeta::default());
            log.store_entries(&batch(1, 50, 1)).unwrap();
            log.flush(true).unwrap();
        }
        let mut segs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|d| {
                let p = d.unwrap().path();
                parse_segment_file_name(p.file_name()?.to_str()?).map(|(seq, _)| (seq, p))
            })
            .collect();
        segs.sort_by_key(|(seq, _)| *seq);
        fs::remove_file(&segs[1].1).unwrap();

        let mut opts = small_opts();
        opts.allow_corrupt_startup = false;
        let err = Log::open(dir.path(), TruncateMeta::default(), opts).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
