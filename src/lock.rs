//! Advisory exclusive lock on the storage directory.
//!
//! Exactly one `DiskStorage` instance may own a directory at a time; the
//! lock is an flock-style lease on a `LOCK` file held for the lifetime of
//! the storage.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fd_lock::RwLock;

use crate::error::{StorageError, StorageResult};

pub(crate) const LOCK_FILE_NAME: &str = "LOCK";

type Guard = fd_lock::RwLockWriteGuard<'static, File>;

/// Holds the exclusive lock until dropped.
pub(crate) struct DirLock {
    // SAFETY: _guard must drop before _lock; Rust drops fields in
    // declaration order.
    _guard: Guard,
    _lock: Box<RwLock<File>>,
}

impl std::fmt::Debug for DirLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLock").finish_non_exhaustive()
    }
}

impl DirLock {
    /// Acquire the exclusive lock on `<dir>/LOCK`, failing immediately if
    /// another process holds it.
    pub fn acquire(dir: &Path) -> StorageResult<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let lock = Box::new(RwLock::new(file));
        // SAFETY: the Box gives the lock a stable address and the guard is
        // dropped before it; the 'static lifetime never escapes this struct.
        let lock_ptr: *mut RwLock<File> = Box::into_raw(lock);
        let guard = match unsafe { (*lock_ptr).try_write() } {
            Ok(guard) => unsafe { std::mem::transmute::<fd_lock::RwLockWriteGuard<'_, File>, Guard>(guard) },
            Err(_) => {
                drop(unsafe { Box::from_raw(lock_ptr) });
                return Err(StorageError::Locked(PathBuf::from(dir)));
            }
        };
        let _lock = unsafe { Box::from_raw(lock_ptr) };
        Ok(Self {
            _guard: guard,
            _lock,
        })
    }
}
