use std::path::PathBuf;

use thiserror::Error;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage error kinds.
///
/// `Compacted` and `OutOfBound` classify out-of-window reads and are part of
/// the normal Raft protocol flow (the caller reacts by sending a snapshot or
/// fixing its bookkeeping). The remaining kinds are genuine failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested index precedes the first retained index. The caller
    /// should fall back to snapshot transfer.
    #[error("index {index} compacted (first index {first_index})")]
    Compacted { index: u64, first_index: u64 },

    /// The requested index lies beyond the last stored index.
    #[error("index {index} out of bound (last index {last_index})")]
    OutOfBound { index: u64, last_index: u64 },

    /// An append would leave a hole in the index sequence.
    #[error("append at index {got} leaves a gap (expected {expected})")]
    Gap { expected: u64, got: u64 },

    /// Checksum or structural invariant failed while reading.
    #[error("corrupt data in {path:?} at offset {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Another process holds the directory lock.
    #[error("storage directory {0:?} is locked by another instance")]
    Locked(PathBuf),

    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn corrupt(
        path: impl Into<PathBuf>,
        offset: u64,
        reason: impl Into<String>,
    ) -> Self {
        StorageError::Corrupt {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// True for error kinds that flag an out-of-window read rather than a
    /// storage failure.
    pub fn is_compacted(&self) -> bool {
        matches!(self, StorageError::Compacted { .. })
    }
}
