//! The VFS instance: open protocol, deletion, and bulk snapshot I/O.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngCore;
use sqlite_vfs::{error::Error, OpenOptions, RegisterError, Vfs};

use crate::content::Registry;
use crate::error::{Error as BackendError, VfsError};
use crate::handle::MemHandle;

/// An in-memory virtual file system.
///
/// All durable state of every database served by this instance lives in one
/// shared registry; cloning the instance only clones the reference, so a
/// clone kept by the caller can snapshot and restore files while SQLite has
/// the VFS registered.
#[derive(Clone, Default)]
pub struct MemVfs {
    registry: Arc<Mutex<Registry>>,
}

impl MemVfs {
    pub fn new() -> MemVfs {
        MemVfs::default()
    }

    /// Register this instance with SQLite under `name`. The instance remains
    /// usable (e.g. for [MemVfs::file_read]) afterwards.
    pub fn register(&self, name: &str, as_default: bool) -> Result<(), RegisterError> {
        sqlite_vfs::register(name, self.clone(), as_default)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot the logical contents of the named file. An empty file yields
    /// an empty buffer; an absent one fails with the not-found kind.
    pub fn file_read(&self, name: &str) -> Result<Vec<u8>, VfsError> {
        tracing::debug!(file = %name, "file_read");
        self.registry().file_read(name)
    }

    /// Atomically replace the named file's contents with `data`, creating the
    /// file when necessary. The page size is re-derived from the embedded
    /// database or WAL header, and a restored database is immediately
    /// writable in WAL mode.
    pub fn file_write(&self, name: &str, data: &[u8]) -> Result<(), VfsError> {
        tracing::debug!(file = %name, len = data.len(), "file_write");
        self.registry().file_write(name, data)
    }
}

impl Vfs for MemVfs {
    type Handle = MemHandle;
    type Error = BackendError;

    fn open(&self, db: &str, opts: OpenOptions) -> Result<MemHandle, Error<BackendError>> {
        tracing::debug!(file = %db, ?opts, "open");
        self.registry().open(db, &opts)?;
        Ok(MemHandle::new(Arc::clone(&self.registry), db.to_string()))
    }

    fn delete(&self, db: &str) -> Result<(), Error<BackendError>> {
        tracing::debug!(file = %db, "delete");
        self.registry().delete(db)
    }

    fn exists(&self, db: &str) -> Result<bool, Error<BackendError>> {
        Ok(self.registry().exists(db))
    }

    fn temporary_name(&self) -> String {
        format!("etilqs_{:016x}", rand::thread_rng().next_u64())
    }

    fn random(&self, buffer: &mut [u8]) {
        rand::thread_rng().fill_bytes(buffer);
    }

    fn sleep(&self, duration: Duration) -> Duration {
        // Nothing here ever blocks; report the requested duration back.
        duration
    }
}
