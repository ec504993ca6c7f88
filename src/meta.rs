//! The `meta` file: Raft hard state plus truncation and applied watermarks.
//!
//! Fixed 64-byte little-endian layout, CRC-protected, rewritten atomically
//! by writing `meta.tmp`, fsyncing it, renaming over `meta`, and fsyncing
//! the parent directory.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StorageError, StorageResult};

pub(crate) const META_FILE_NAME: &str = "meta";
const META_TMP_NAME: &str = "meta.tmp";

const META_MAGIC: u32 = 0x4154_454d; // "META" little-endian
const META_VERSION: u32 = 1;
const META_SIZE: usize = 64;

/// Raft hard state, persisted before any vote or commit is acted upon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

/// The last entry covered by the most recent snapshot. Entries at or below
/// `index` are compacted away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateMeta {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Meta {
    pub hard_state: HardState,
    pub truncated: TruncateMeta,
    pub applied_index: u64,
}

impl Meta {
    fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        buf[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&META_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.hard_state.term.to_le_bytes());
        buf[16..24].copy_from_slice(&self.hard_state.vote.to_le_bytes());
        buf[24..32].copy_from_slice(&self.hard_state.commit.to_le_bytes());
        buf[32..40].copy_from_slice(&self.truncated.index.to_le_bytes());
        buf[40..48].copy_from_slice(&self.truncated.term.to_le_bytes());
        buf[48..56].copy_from_slice(&self.applied_index.to_le_bytes());
        // bytes 56..60 reserved
        let crc = crc32fast::hash(&buf[..META_SIZE - 4]);
        buf[60..64].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8], path: &Path) -> StorageResult<Self> {
        if buf.len() != META_SIZE {
            return Err(StorageError::corrupt(
                path,
                0,
                format!("meta file is {} bytes, expected {}", buf.len(), META_SIZE),
            ));
        }
        let expected = u32::from_le_bytes(buf[60..64].try_into().unwrap());
        if crc32fast::hash(&buf[..META_SIZE - 4]) != expected {
            return Err(StorageError::corrupt(path, 0, "meta crc mismatch"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != META_MAGIC {
            return Err(StorageError::corrupt(path, 0, "bad meta magic"));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != META_VERSION {
            return Err(StorageError::corrupt(
                path,
                4,
                format!("unsupported meta version {}", version),
            ));
        }
        Ok(Self {
            hard_state: HardState {
                term: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
                vote: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
                commit: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            },
            truncated: TruncateMeta {
                index: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
                term: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            },
            applied_index: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
        })
    }

    /// Load the meta file from `dir`. Returns defaults (and `existed =
    /// false`) when the file is missing. A parse failure resets to defaults
    /// when `allow_reset` is set, and fails otherwise.
    pub fn load(dir: &Path, allow_reset: bool) -> StorageResult<(Self, bool)> {
        let path = dir.join(META_FILE_NAME);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Self::default(), false))
            }
            Err(e) => return Err(e.into()),
        };
        match Self::decode(&buf, &path) {
            Ok(meta) => Ok((meta, true)),
            Err(e) if allow_reset => {
                warn!(path = %path.display(), "meta file unreadable ({}), resetting to defaults", e);
                Ok((Self::default(), false))
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the meta file.
    pub fn persist(&self, dir: &Path) -> StorageResult<()> {
        let tmp = dir.join(META_TMP_NAME);
        let path = dir.join(META_FILE_NAME);

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(&self.encode())?;
        f.sync_all()?;
        drop(f);

        fs::rename(&tmp, &path)?;
        // The rename itself must be durable.
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}
