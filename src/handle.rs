//! One open handle onto a content.

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use sqlite_vfs::{error::Error, DatabaseHandle, LockKind, ShmLockMode};

use crate::content::Registry;
use crate::error::Error as BackendError;
use crate::shm::ShmHandle;

type Result<T> = std::result::Result<T, Error<BackendError>>;

/// A file opened on a [crate::MemVfs]. Handles resolve their content by name
/// under the instance lock, so several handles of the same file observe one
/// shared content.
pub struct MemHandle {
    registry: Arc<Mutex<Registry>>,
    name: String,
    lock: LockKind,
    shm: ShmHandle,
}

impl MemHandle {
    pub(crate) fn new(registry: Arc<Mutex<Registry>>, name: String) -> MemHandle {
        MemHandle {
            registry,
            name,
            lock: LockKind::None,
            shm: ShmHandle::default(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A poisoned instance lock only means another handle panicked
        // mid-operation; the registry itself stays usable.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemHandle")
            .field("name", &self.name)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle for MemHandle {
    type Error = BackendError;

    fn size(&self) -> Result<u64> {
        self.registry().file_size(&self.name)
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.registry().read(&self.name, offset, buf)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.registry().write(&self.name, offset, buf)
    }

    fn sync(&mut self, _data_only: bool) -> Result<()> {
        self.registry().sync(&self.name)
    }

    fn set_len(&mut self, size: u64) -> Result<()> {
        self.registry().truncate(&self.name, size)
    }

    fn lock(&mut self, lock: LockKind) -> Result<bool> {
        self.registry().set_lock(&self.name, self.lock, lock);
        self.lock = lock;
        Ok(true)
    }

    fn reserved(&mut self) -> Result<bool> {
        self.registry().reserved(&self.name, self.lock)
    }

    fn current_lock(&self) -> Result<LockKind> {
        Ok(self.lock)
    }

    fn pragma(&mut self, pragma: &str, value: Option<&str>) -> Result<()> {
        tracing::trace!(file = %self.name, pragma, ?value, "pragma");
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pragma(&self.name, pragma, value)
    }

    fn shm_map(&mut self, region: u32, size: usize, extend: bool) -> Result<Option<NonNull<u8>>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .shm_map(&self.name, region, size, extend, &mut self.shm)
    }

    fn shm_lock(&mut self, slots: Range<u8>, mode: ShmLockMode) -> Result<bool> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .shm_lock(&self.name, slots, mode, &mut self.shm)
    }

    fn shm_unlock(&mut self, slots: Range<u8>, mode: ShmLockMode) -> Result<()> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .shm_unlock(&self.name, slots, mode, &mut self.shm)
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .shm_unmap(&self.name, delete, &mut self.shm)
    }
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        tracing::trace!(file = %self.name, "closing handle");
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .close_handle(&self.name, self.lock, &mut self.shm);
    }
}
