//! A single append-only log segment.
//!
//! Segment file format:
//!
//! ```text
//! | header (32B) | record ... record | footer (only when sealed) |
//! ```
//!
//! Header: `magic(4) | version(4) | seq(8) | first_index(8) | flags(4) | reserved(4)`.
//! Footer: `magic(4) | count(8) | offsets[count](8 each) | last_index(8) | crc32(4)`.
//!
//! A sealed segment is recognized by a valid footer at the end of the file.
//! An unsealed segment is scanned forward record by record; a bad record
//! stops the scan and (when tolerated) the file is truncated to the last
//! good offset. A rebuildable `.idx` sidecar carries the same offset table
//! so sealed segments can be reloaded without touching the footer.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use tracing::{debug, warn};

use crate::entry::{decode_record, decode_record_at, Entry, RECORD_HEADER_SIZE, RECORD_OVERHEAD};
use crate::error::{StorageError, StorageResult};

pub(crate) const LOG_FILE_MAGIC: u32 = 0x474f_4c52; // "RLOG" little-endian
pub(crate) const LOG_FILE_VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: u64 = 32;

const FOOTER_MAGIC: u32 = 0x544f_4f46; // "FOOT" little-endian
/// Footer length excluding the offset table.
const FOOTER_FIXED: u64 = 24;

pub(crate) const LOG_FILE_EXT: &str = "log";
pub(crate) const SIDECAR_EXT: &str = "idx";

pub(crate) fn segment_file_name(seq: u64, first_index: u64) -> String {
    format!("{:016x}-{:016x}.{}", seq, first_index, LOG_FILE_EXT)
}

fn sidecar_path(log_path: &Path) -> PathBuf {
    log_path.with_extension(SIDECAR_EXT)
}

/// Parse `<seq:016x>-<first_index:016x>.log` into `(seq, first_index)`.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".log")?;
    let (seq, first) = stem.split_once('-')?;
    if seq.len() != 16 || first.len() != 16 {
        return None;
    }
    Some((
        u64::from_str_radix(seq, 16).ok()?,
        u64::from_str_radix(first, 16).ok()?,
    ))
}

/// Sidecar offset index, rebuildable from the segment itself.
/// Serialized as bincode followed by a trailing crc32 (LE).
#[derive(Debug, Encode, Decode)]
struct SidecarIndex {
    seq: u64,
    first_index: u64,
    last_index: u64,
    offsets: Vec<u64>,
}

/// One append-only segment file.
///
/// The in-memory offset table mirrors the record body: `offsets[i]` is the
/// file offset of entry `first_index + i`. Appends are buffered in `wbuf`
/// until [`LogFile::flush`] pushes them to the OS.
#[derive(Debug)]
pub(crate) struct LogFile {
    path: PathBuf,
    file: File,
    seq: u64,
    first_index: u64,
    offsets: Vec<u64>,
    /// Logical end of the record body (next append position). A sealed
    /// file's footer lives beyond this offset.
    body_end: u64,
    /// File offset up to which the body is on disk. `body_end - disk_end`
    /// bytes are still buffered in `wbuf`.
    disk_end: u64,
    wbuf: Vec<u8>,
    sealed: bool,
}

/// Result of opening an existing segment file.
#[derive(Debug)]
pub(crate) struct OpenedLogFile {
    pub file: LogFile,
    /// True if a corrupt tail was dropped during the open scan.
    pub recovered: bool,
}

impl LogFile {
    /// Create a fresh active segment seeded at `first_index`.
    pub fn create(dir: &Path, seq: u64, first_index: u64) -> StorageResult<Self> {
        let path = dir.join(segment_file_name(seq, first_index));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&LOG_FILE_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&LOG_FILE_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&seq.to_le_bytes());
        header[16..24].copy_from_slice(&first_index.to_le_bytes());
        // flags and reserved stay zero
        file.write_all_at(&header, 0)?;
        file.sync_data()?;

        debug!(seq, first_index, path = %path.display(), "created log file");

        Ok(Self {
            path,
            file,
            seq,
            first_index,
            offsets: Vec::new(),
            body_end: HEADER_SIZE,
            disk_end: HEADER_SIZE,
            wbuf: Vec::new(),
            sealed: false,
        })
    }

    /// Open an existing segment, loading the footer/sidecar if sealed or
    /// scanning the body otherwise.
    ///
    /// `allow_corrupt` controls whether a bad tail is truncated away or
    /// surfaced as a hard [`StorageError::Corrupt`].
    pub fn open(path: PathBuf, seq: u64, first_index: u64, allow_corrupt: bool) -> StorageResult<OpenedLogFile> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        if file_len < HEADER_SIZE {
            // Crash before the header hit the disk; the file never held a
            // durable record.
            if !allow_corrupt {
                return Err(StorageError::corrupt(&path, 0, "truncated header"));
            }
            warn!(path = %path.display(), "log file header truncated, resetting");
            let lf = Self::reset_as_empty(path, file, seq, first_index)?;
            return Ok(OpenedLogFile {
                file: lf,
                recovered: true,
            });
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let hdr_seq = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let hdr_first = u64::from_le_bytes(header[16..24].try_into().unwrap());

        if magic != LOG_FILE_MAGIC {
            return Err(StorageError::corrupt(&path, 0, "bad magic"));
        }
        if version != LOG_FILE_VERSION {
            return Err(StorageError::corrupt(
                &path,
                4,
                format!("unsupported version {}", version),
            ));
        }
        if hdr_seq != seq || hdr_first != first_index {
            return Err(StorageError::corrupt(
                &path,
                8,
                format!(
                    "header ({}, {}) disagrees with file name ({}, {})",
                    hdr_seq, hdr_first, seq, first_index
                ),
            ));
        }

        // Sealed files are identified by a valid footer.
        if let Some((offsets, last_index, body_end)) =
            Self::try_load_footer(&file, file_len, first_index)?
        {
            let offsets = match Self::try_load_sidecar(&path, seq, first_index, last_index) {
                Some(side) if side == offsets => side,
                Some(_) => {
                    warn!(path = %path.display(), "stale sidecar index, using footer");
                    offsets
                }
                None => offsets,
            };
            return Ok(OpenedLogFile {
                file: Self {
                    path,
                    file,
                    seq,
                    first_index,
                    offsets,
                    body_end,
                    disk_end: body_end,
                    wbuf: Vec::new(),
                    sealed: true,
                },
                recovered: false,
            });
        }

        // No footer: scan forward, validating each record.
        Self::scan_body(path, file, file_len, seq, first_index, allow_corrupt)
    }

    fn reset_as_empty(path: PathBuf, file: File, seq: u64, first_index: u64) -> StorageResult<Self> {
        file.set_len(0)?;
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&LOG_FILE_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&LOG_FILE_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&seq.to_le_bytes());
        header[16..24].copy_from_slice(&first_index.to_le_bytes());
        file.write_all_at(&header, 0)?;
        file.sync_data()?;
        Ok(Self {
            path,
            file,
            seq,
            first_index,
            offsets: Vec::new(),
            body_end: HEADER_SIZE,
            disk_end: HEADER_SIZE,
            wbuf: Vec::new(),
            sealed: false,
        })
    }

    /// Probe for a sealed footer at the end of the file.
    ///
    /// The footer's offset table is variable-length, so the record count is
    /// recovered from the trailing `last_index` field first (indices within
    /// a segment are contiguous), then the magic and checksum are verified.
    /// Returns `(offsets, last_index, body_end)` on success.
    fn try_load_footer(
        file: &File,
        file_len: u64,
        first_index: u64,
    ) -> StorageResult<Option<(Vec<u64>, u64, u64)>> {
        if file_len < HEADER_SIZE + FOOTER_FIXED + 8 {
            return Ok(None);
        }
        let mut tail = [0u8; 12];
        file.read_exact_at(&mut tail, file_len - 12)?;
        let last_index = u64::from_le_bytes(tail[0..8].try_into().unwrap());
        if last_index < first_index {
            return Ok(None);
        }
        let count = last_index - first_index + 1;
        let footer_len = match count
            .checked_mul(8)
            .and_then(|v| v.checked_add(FOOTER_FIXED))
        {
            Some(v) => v,
            None => return Ok(None),
        };
        if footer_len > file_len - HEADER_SIZE {
            return Ok(None);
        }
        let footer_start = file_len - footer_len;

        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact_at(&mut footer, footer_start)?;

        let magic = u32::from_le_bytes(footer[0..4].try_into().unwrap());
        if magic != FOOTER_MAGIC {
            return Ok(None);
        }
        let stored_count = u64::from_le_bytes(footer[4..12].try_into().unwrap());
        if stored_count != count {
            return Ok(None);
        }
        let crc_offset = footer.len() - 4;
        let expected = u32::from_le_bytes(footer[crc_offset..].try_into().unwrap());
        if crc32fast::hash(&footer[..crc_offset]) != expected {
            return Ok(None);
        }

        let mut offsets = Vec::with_capacity(count as usize);
        let mut prev = 0u64;
        for i in 0..count as usize {
            let at = 12 + i * 8;
            let off = u64::from_le_bytes(footer[at..at + 8].try_into().unwrap());
            if off < HEADER_SIZE || off >= footer_start || (i > 0 && off <= prev) {
                return Ok(None);
            }
            prev = off;
            offsets.push(off);
        }
        if offsets.first() != Some(&HEADER_SIZE) {
            return Ok(None);
        }
        Ok(Some((offsets, last_index, footer_start)))
    }

    fn try_load_sidecar(path: &Path, seq: u64, first_index: u64, last_index: u64) -> Option<Vec<u64>> {
        let side = sidecar_path(path);
        let buf = fs::read(&side).ok()?;
        if buf.len() < 4 {
            return None;
        }
        let crc_offset = buf.len() - 4;
        let expected = u32::from_le_bytes(buf[crc_offset..].try_into().unwrap());
        if crc32fast::hash(&buf[..crc_offset]) != expected {
            warn!(path = %side.display(), "sidecar index crc mismatch, ignoring");
            return None;
        }
        let (idx, _): (SidecarIndex, usize) =
            bincode::decode_from_slice(&buf[..crc_offset], bincode::config::standard()).ok()?;
        if idx.seq != seq || idx.first_index != first_index || idx.last_index != last_index {
            return None;
        }
        Some(idx.offsets)
    }

    fn scan_body(
        path: PathBuf,
        file: File,
        file_len: u64,
        seq: u64,
        first_index: u64,
        allow_corrupt: bool,
    ) -> StorageResult<OpenedLogFile> {
        let mut offsets = Vec::new();
        let mut offset = HEADER_SIZE;
        let mut next_index = first_index;
        let mut bad: Option<String> = None;

        while offset < file_len {
            if offset + RECORD_OVERHEAD > file_len {
                bad = Some("trailing partial frame".to_string());
                break;
            }
            let mut head = [0u8; RECORD_HEADER_SIZE as usize];
            file.read_exact_at(&mut head, offset)?;
            let payload_len = u32::from_le_bytes(head[1..5].try_into().unwrap()) as u64;
            let frame_len = RECORD_OVERHEAD + payload_len;
            if offset + frame_len > file_len {
                bad = Some("trailing partial record".to_string());
                break;
            }
            let mut frame = vec![0u8; frame_len as usize];
            file.read_exact_at(&mut frame, offset)?;
            match decode_record(&frame) {
                Ok(rec) if rec.entry.index == next_index => {
                    offsets.push(offset);
                    offset += frame_len;
                    next_index += 1;
                }
                Ok(rec) => {
                    bad = Some(format!(
                        "index discontinuity: expected {}, found {}",
                        next_index, rec.entry.index
                    ));
                    break;
                }
                Err(reason) => {
                    bad = Some(reason);
                    break;
                }
            }
        }

        let recovered = if let Some(reason) = bad {
            if !allow_corrupt {
                return Err(StorageError::corrupt(&path, offset, reason));
            }
            warn!(
                path = %path.display(),
                offset,
                reason = %reason,
                dropped = file_len - offset,
                "corrupt log tail, truncating"
            );
            file.set_len(offset)?;
            file.sync_data()?;
            true
        } else {
            false
        };

        Ok(OpenedLogFile {
            file: Self {
                path,
                file,
                seq,
                first_index,
                offsets,
                body_end: offset,
                disk_end: offset,
                wbuf: Vec::new(),
                sealed: false,
            },
            recovered,
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index the next appended record must carry.
    pub fn next_index(&self) -> u64 {
        self.first_index + self.offsets.len() as u64
    }

    /// Greatest index present, or `None` for an empty segment.
    pub fn last_index(&self) -> Option<u64> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(self.first_index + self.offsets.len() as u64 - 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Logical size of the record body in bytes (header included, footer
    /// excluded).
    pub fn size(&self) -> u64 {
        self.body_end
    }

    /// Buffer one framed record for append.
    ///
    /// Returns `false` without consuming the record when it would push the
    /// body past `size_limit`; the caller seals this file and rolls over. A
    /// record that alone exceeds the limit is still accepted into an empty
    /// file so oversized entries remain storable.
    pub fn append(&mut self, index: u64, frame: &[u8], size_limit: u64) -> bool {
        debug_assert!(!self.sealed);
        debug_assert_eq!(index, self.next_index());
        if !self.offsets.is_empty() && self.body_end + frame.len() as u64 > size_limit {
            return false;
        }
        self.offsets.push(self.body_end);
        self.wbuf.extend_from_slice(frame);
        self.body_end += frame.len() as u64;
        true
    }

    /// Write all buffered bytes to the OS and optionally fsync.
    pub fn flush(&mut self, sync: bool) -> StorageResult<()> {
        if !self.wbuf.is_empty() {
            self.file.write_all_at(&self.wbuf, self.disk_end)?;
            self.disk_end += self.wbuf.len() as u64;
            self.wbuf.clear();
        }
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Read the entry at `index` along with its serialized payload length.
    pub fn read_entry(&self, index: u64) -> StorageResult<(Entry, u64)> {
        let in_range = matches!(self.last_index(), Some(l) if index >= self.first_index && index <= l);
        if !in_range {
            return Err(StorageError::OutOfBound {
                index,
                last_index: self
                    .last_index()
                    .unwrap_or(self.first_index.saturating_sub(1)),
            });
        }
        let i = (index - self.first_index) as usize;
        let start = self.offsets[i];
        let end = if i + 1 < self.offsets.len() {
            self.offsets[i + 1]
        } else {
            self.body_end
        };
        let frame = self.read_span(start, end)?;
        let rec = decode_record_at(&frame, &self.path, start)?;
        if rec.entry.index != index {
            return Err(StorageError::corrupt(
                &self.path,
                start,
                format!("record holds index {}, expected {}", rec.entry.index, index),
            ));
        }
        Ok((rec.entry, rec.payload_len))
    }

    /// Read `[start, end)` of the body, stitching disk and write buffer.
    fn read_span(&self, start: u64, end: u64) -> StorageResult<Vec<u8>> {
        debug_assert!(start <= end && end <= self.body_end);
        let mut buf = vec![0u8; (end - start) as usize];
        if end <= self.disk_end {
            self.file.read_exact_at(&mut buf, start)?;
        } else if start >= self.disk_end {
            let from = (start - self.disk_end) as usize;
            let len = buf.len();
            buf.copy_from_slice(&self.wbuf[from..from + len]);
        } else {
            let on_disk = (self.disk_end - start) as usize;
            self.file.read_exact_at(&mut buf[..on_disk], start)?;
            buf[on_disk..].copy_from_slice(&self.wbuf[..(end - self.disk_end) as usize]);
        }
        Ok(buf)
    }

    /// Write the footer and sidecar, fsync, and mark the file immutable.
    pub fn seal(&mut self) -> StorageResult<()> {
        debug_assert!(!self.sealed);
        debug_assert!(!self.offsets.is_empty(), "never seal an empty segment");
        self.flush(false)?;

        let last_index = self.last_index().expect("sealed segment is non-empty");
        let mut footer =
            Vec::with_capacity(FOOTER_FIXED as usize + self.offsets.len() * 8);
        footer.extend_from_slice(&FOOTER_MAGIC.to_le_bytes());
        footer.extend_from_slice(&(self.offsets.len() as u64).to_le_bytes());
        for off in &self.offsets {
            footer.extend_from_slice(&off.to_le_bytes());
        }
        footer.extend_from_slice(&last_index.to_le_bytes());
        let crc = crc32fast::hash(&footer);
        footer.extend_from_slice(&crc.to_le_bytes());

        self.file.write_all_at(&footer, self.body_end)?;
        self.file.sync_data()?;
        self.sealed = true;

        self.write_sidecar(last_index);
        debug!(seq = self.seq, last_index, path = %self.path.display(), "sealed log file");
        Ok(())
    }

    /// The sidecar is a rebuildable cache; failures only warn.
    fn write_sidecar(&self, last_index: u64) {
        let idx = SidecarIndex {
            seq: self.seq,
            first_index: self.first_index,
            last_index,
            offsets: self.offsets.clone(),
        };
        let res = bincode::encode_to_vec(&idx, bincode::config::standard()).map(|mut buf| {
            let crc = crc32fast::hash(&buf);
            buf.extend_from_slice(&crc.to_le_bytes());
            fs::write(sidecar_path(&self.path), buf)
        });
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %self.path.display(), "sidecar write failed: {}", e),
            Err(e) => warn!(path = %self.path.display(), "sidecar encode failed: {}", e),
        }
    }

    /// Strip the footer so a previously sealed file becomes the writable
    /// tail again (used when a conflict truncation reaches back into it).
    pub fn unseal(&mut self) -> StorageResult<()> {
        debug_assert!(self.sealed);
        self.file.set_len(self.body_end)?;
        self.file.sync_data()?;
        if let Err(e) = fs::remove_file(sidecar_path(&self.path)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "sidecar remove failed: {}", e);
            }
        }
        self.sealed = false;
        Ok(())
    }

    /// Drop all records with `index >= k` and shrink the file accordingly.
    /// Only legal on the active (unsealed) tail.
    pub fn truncate_suffix(&mut self, k: u64) -> StorageResult<()> {
        debug_assert!(!self.sealed);
        debug_assert!(k >= self.first_index);
        if k >= self.next_index() {
            return Ok(());
        }
        self.flush(false)?;
        let keep = (k - self.first_index) as usize;
        let new_end = if keep == 0 {
            HEADER_SIZE
        } else {
            // The record holding entry k starts where the kept prefix ends.
            self.offsets[keep]
        };
        self.offsets.truncate(keep);
        self.file.set_len(new_end)?;
        self.file.sync_data()?;
        self.body_end = new_end;
        self.disk_end = new_end;
        Ok(())
    }

    /// Unlink the segment and its sidecar.
    pub fn retire(self) -> StorageResult<()> {
        debug!(seq = self.seq, path = %self.path.display(), "retiring log file");
        fs::remove_file(&self.path)?;
        match fs::remove_file(sidecar_path(&self.path)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Overwrite bytes inside the last record on disk (fault injection).
    #[cfg(any(test, debug_assertions, feature = "fault-injection"))]
    pub fn corrupt_last_record(&mut self) -> StorageResult<()> {
        self.flush(true)?;
        let start = *self.offsets.last().expect("segment has records");
        let mid = start + (self.body_end - start) / 2;
        self.file.write_all_at(&[0xde, 0xad, 0xbe, 0xef], mid)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Append a garbage block past the record body on disk without touching
    /// the offset table (fault injection: torn tail write).
    #[cfg(any(test, debug_assertions, feature = "fault-injection"))]
    pub fn append_garbage(&mut self, len: usize) -> StorageResult<()> {
        self.flush(true)?;
        let garbage = vec![0xa5u8; len];
        self.file.write_all_at(&garbage, self.body_end)?;
        self.file.sync_data()?;
        Ok(())
    }
}
