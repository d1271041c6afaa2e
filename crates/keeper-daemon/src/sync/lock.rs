use std::fs::File;
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::status::StatusStore;

/// Non-blocking exclusive lock around storage I/O.
///
/// The in-process mutex excludes the sync loop, manual triggers and the
/// shutdown drain from each other; the file lock on `sync.lock` excludes
/// other daemon instances sharing the state directory. Busy means skip.
#[derive(Debug, Clone)]
pub struct SyncLock {
    local: Arc<Mutex<()>>,
    status: StatusStore,
}

/// Holds both layers of a [`SyncLock`] until dropped.
#[derive(Debug)]
pub struct SyncLockGuard {
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release sync lock file: {}", e);
        }
    }
}

impl SyncLock {
    pub fn new(status: StatusStore) -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            status,
        }
    }

    /// Take the lock if it is free. `Ok(None)` means another sync holds it.
    pub fn try_acquire(&self) -> Result<Option<SyncLockGuard>, StorageError> {
        let Ok(local) = self.local.clone().try_lock_owned() else {
            debug!("Sync lock held in this process");
            return Ok(None);
        };

        let file = self.status.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(SyncLockGuard {
                file,
                _local: local,
            })),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                debug!("Sync lock held by another process");
                Ok(None)
            }
            Err(e) => Err(StorageError::Lock(format!(
                "Failed to acquire sync lock: {}",
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_busy_until_release() {
        let temp = TempDir::new().unwrap();
        let lock = SyncLock::new(StatusStore::new(temp.path()));

        let guard = lock.try_acquire().unwrap().expect("lock should be free");
        assert!(lock.try_acquire().unwrap().is_none());
        assert!(lock.clone().try_acquire().unwrap().is_none());

        drop(guard);
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn test_separate_instances_exclude_each_other() {
        let temp = TempDir::new().unwrap();
        let first = SyncLock::new(StatusStore::new(temp.path()));
        let second = SyncLock::new(StatusStore::new(temp.path()));

        let guard = first.try_acquire().unwrap().expect("lock should be free");
        assert!(second.try_acquire().unwrap().is_none());
        drop(guard);
        assert!(second.try_acquire().unwrap().is_some());
    }
}
