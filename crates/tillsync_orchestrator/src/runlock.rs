//! The dual-layer global run lock.
//!
//! Layer 1 is the store row (queryable holder info, survives restarts).
//! Layer 2 is an advisory file lock on `<state>/global_run.lock`, held by
//! this process for the lifetime of the run; the kernel drops it when the
//! process dies, so a crash can never wedge the slot. Both layers must be
//! free to start a job and both are released together.
//!
//! The child subprocess is told the lock is already held via
//! `ORCHESTRATOR_LOCK_HELD=1` so it does not try to re-acquire.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use tillsync_store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("run lock is busy: held by {holder}")]
    Busy { holder: String },

    #[error("lock file error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Guard over both lock layers. Dropping it releases the file lock; call
/// [`HeldLock::release`] to clear the store row as well.
#[derive(Debug)]
pub struct HeldLock {
    _file: File,
    owner_job: Option<String>,
}

impl HeldLock {
    pub(crate) fn new(file: File, owner_job: Option<String>) -> Self {
        Self {
            _file: file,
            owner_job,
        }
    }

    /// Release both layers. Idempotent and infallible: store errors are
    /// logged, and the file lock is dropped by the kernel regardless.
    pub async fn release(self, store: &Store) {
        let owner = self.owner_job.clone();
        if let Err(e) = store.release_lock_row(owner.as_deref(), true).await {
            warn!("failed to release run lock row: {e}");
        }
        debug!("released run lock (owner_job={:?})", owner);
        // File lock released on drop.
    }
}

/// Try to take the advisory file lock, non-blocking.
pub fn try_lock_file(lock_path: &Path) -> Result<File, LockError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            debug!("acquired run lock file: {}", lock_path.display());
            Ok(file)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Busy {
            holder: "another process (file lock)".to_string(),
        }),
        Err(e) => Err(LockError::Io(e)),
    }
}

/// Acquire both layers: the store row first (it garbage-collects stale
/// owners), then the file lock. If the file lock is busy the row is rolled
/// back before returning.
pub async fn acquire(
    store: &Store,
    lock_path: &Path,
    holder: &str,
    owner_job: Option<&str>,
) -> Result<HeldLock, LockError> {
    match store.acquire_lock_row(holder, owner_job).await {
        Ok(()) => {}
        Err(StoreError::LockBusy { holder }) => return Err(LockError::Busy { holder }),
        Err(e) => return Err(e.into()),
    }

    match try_lock_file(lock_path) {
        Ok(file) => Ok(HeldLock::new(file, owner_job.map(str::to_string))),
        Err(e) => {
            if let Err(release_err) = store.release_lock_row(owner_job, true).await {
                warn!("failed to roll back lock row after file-lock failure: {release_err}");
            }
            Err(e)
        }
    }
}
