//! Durable, segmented log storage for a single Raft replica group.
//!
//! The engine persists the replicated log as a sequence of append-only
//! segment files with CRC-protected record framing, plus a small meta file
//! carrying the Raft hard state and the snapshot/applied watermarks. It
//! serves entries back for replay and replication, overwrites conflicting
//! suffixes when a new leader rewrites the tail, installs snapshot
//! boundaries, and compacts old segments by file count.
//!
//! # Module Structure
//!
//! - `entry`: entry model and on-disk record framing
//! - `log_file`: one append-only segment (header, records, footer, sidecar)
//! - `log`: the ordered segment collection with the index window
//! - `meta`: hard state plus truncation/applied meta, atomically rewritten
//! - `lock`: advisory exclusive lock on the storage directory
//! - `storage`: the [`DiskStorage`] façade the Raft core drives
//!
//! # Example
//!
//! ```rust,ignore
//! use raft_disklog::{DiskStorage, Entry, Options};
//!
//! let storage = DiskStorage::open("./group-1", Options::default())?;
//! storage.store_entries(&[Entry::new(1, 1, b"set x=1".to_vec())])?;
//! let entries = storage.entries(1, 2, u64::MAX)?;
//! storage.close()?;
//! ```

mod entry;
mod error;
mod lock;
mod log;
mod log_file;
mod meta;
mod storage;

pub use entry::{Entry, EntryType};
pub use error::{StorageError, StorageResult};
pub use meta::{HardState, TruncateMeta};
pub use storage::{DiskStats, DiskStorage, FsyncPolicy, Options, SnapshotMeta};
