//! Create a custom SQLite virtual file system by implementing the [Vfs] trait
//! and registering it using [register].
//!
//! All trait methods are synchronous: a registered VFS runs inline with the
//! SQLite call that entered it and must complete every operation before
//! returning.

pub mod error;
pub mod io;
pub mod state;
pub mod vfs;

use std::borrow::Cow;
use std::ffi::CString;
use std::mem::size_of;
use std::ops::Range;
use std::ptr::{null_mut, NonNull};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use state::{FileState, State};

/// A file opened by a [Vfs].
pub trait DatabaseHandle {
    type Error: std::error::Error;

    /// Return the current size in bytes of the file.
    fn size(&self) -> Result<u64, error::Error<Self::Error>>;

    /// Fill `buf` with the bytes at `offset`. A range past the end of the
    /// file must zero-fill `buf` and return [error::Error::ShortRead].
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64)
        -> Result<(), error::Error<Self::Error>>;

    /// Write all of `buf` at `offset`.
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), error::Error<Self::Error>>;

    /// Make sure all writes are committed to the underlying storage. If
    /// `data_only` is set to `true`, only the data and not the metadata (like
    /// size, access time, etc) should be synced.
    fn sync(&mut self, data_only: bool) -> Result<(), error::Error<Self::Error>>;

    /// Set the file to the specified `size`.
    fn set_len(&mut self, size: u64) -> Result<(), error::Error<Self::Error>>;

    /// Lock the file. Returns whether the requested lock could be acquired.
    /// Locking sequence:
    /// - The lock is never moved from [LockKind::None] to anything higher than
    ///   [LockKind::Shared].
    /// - A [LockKind::Pending] is never requested explicitly.
    /// - A [LockKind::Shared] is always held when a [LockKind::Reserved] lock
    ///   is requested.
    fn lock(&mut self, lock: LockKind) -> Result<bool, error::Error<Self::Error>>;

    /// Unlock the file.
    fn unlock(&mut self, lock: LockKind) -> Result<bool, error::Error<Self::Error>> {
        self.lock(lock)
    }

    /// Check if any other handle of the same file holds a
    /// [LockKind::Reserved], [LockKind::Pending] or [LockKind::Exclusive]
    /// lock.
    fn reserved(&mut self) -> Result<bool, error::Error<Self::Error>>;

    /// Return the current [LockKind] of this handle.
    fn current_lock(&self) -> Result<LockKind, error::Error<Self::Error>>;

    /// Intercept a `PRAGMA name [= value]` statement before SQLite processes
    /// it. `Ok(())` lets normal pragma processing continue; an error aborts
    /// the statement with the corresponding SQLite code.
    fn pragma(
        &mut self,
        _name: &str,
        _value: Option<&str>,
    ) -> Result<(), error::Error<Self::Error>> {
        Ok(())
    }

    /// Change the chunk size of the file to `chunk_size`.
    fn set_chunk_size(&self, _chunk_size: usize) -> Result<(), error::Error<Self::Error>> {
        Ok(())
    }

    /// Check if the underlying data of the handle got moved or deleted. When
    /// moved, the handle can still be read from, but not written to anymore.
    fn moved(&self) -> Result<bool, error::Error<Self::Error>> {
        Ok(false)
    }

    /// Map the shared-memory region `region` (each region is `size` bytes)
    /// and return a pointer that stays valid until the region is deleted.
    /// With `extend` unset, a region that does not exist yet is reported as
    /// `None` instead of being allocated.
    fn shm_map(
        &mut self,
        region: u32,
        size: usize,
        extend: bool,
    ) -> Result<Option<NonNull<u8>>, error::Error<Self::Error>>;

    /// Acquire the lock-table slots `slots` in `mode`. Returns `false` when a
    /// competing holder blocks the acquisition.
    fn shm_lock(
        &mut self,
        slots: Range<u8>,
        mode: ShmLockMode,
    ) -> Result<bool, error::Error<Self::Error>>;

    /// Release the lock-table slots `slots` held by this handle in `mode`.
    /// Slots the handle does not hold are skipped.
    fn shm_unlock(
        &mut self,
        slots: Range<u8>,
        mode: ShmLockMode,
    ) -> Result<(), error::Error<Self::Error>>;

    /// Memory barrier between writes to the shared-memory region.
    fn shm_barrier(&self) {}

    /// Release this handle's shared-memory mapping; with `delete` set, the
    /// shared memory is destroyed once the last handle unmaps.
    fn shm_unmap(&mut self, delete: bool) -> Result<(), error::Error<Self::Error>>;
}

/// A virtual file system for SQLite.
pub trait Vfs {
    /// The file returned by [Vfs::open].
    type Handle: DatabaseHandle<Error = Self::Error>;

    type Error: std::error::Error;

    /// Open the database `db` (of type `opts.kind`).
    fn open(&self, db: &str, opts: OpenOptions) -> Result<Self::Handle, error::Error<Self::Error>>;

    /// Delete the database `db`.
    fn delete(&self, db: &str) -> Result<(), error::Error<Self::Error>>;

    /// Check if a database `db` already exists.
    fn exists(&self, db: &str) -> Result<bool, error::Error<Self::Error>>;

    /// Generate and return a path for a temporary database.
    fn temporary_name(&self) -> String;

    /// Populate the `buffer` with random data.
    fn random(&self, buffer: &mut [u8]);

    /// Sleep for `duration`. Return the duration actually slept.
    fn sleep(&self, duration: Duration) -> Duration;

    /// Check access to `db`. The default implementation always returns `true`.
    fn access(&self, _db: &str, _write: bool) -> Result<bool, error::Error<Self::Error>> {
        Ok(true)
    }

    /// Retrieve the full pathname of a database `db`.
    fn full_pathname<'a>(&self, db: &'a str) -> Result<Cow<'a, str>, error::Error<Self::Error>> {
        Ok(db.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOptions {
    /// The object type that is being opened.
    pub kind: OpenKind,

    /// The access an object is opened with.
    pub access: OpenAccess,

    /// The file should be deleted when it is closed.
    pub delete_on_close: bool,
}

/// The object type that is being opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenKind {
    MainDb,
    MainJournal,
    TempDb,
    TempJournal,
    TransientDb,
    SubJournal,
    SuperJournal,
    Wal,
    /// No type flag was passed; the backend decides based on the name.
    Unspecified,
}

/// The access an object is opened with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenAccess {
    /// Read access.
    Read,

    /// Write access (includes read access).
    Write,

    /// Create the file if it does not exist (includes write and read access).
    Create,

    /// Create the file, but throw if it it already exist (includes write and
    /// read access).
    CreateNew,
}

/// The two modes of the shared-memory lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmLockMode {
    Shared,
    Exclusive,
}

/// The access an object is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockKind {
    /// No locks are held. The database may be neither read nor written. Any
    /// internally cached data is considered suspect and subject to
    /// verification against the database file before being used. Other
    /// processes can read or write the database as their own locking states
    /// permit. This is the default state.
    #[default]
    None,

    /// The database may be read but not written. Any number of processes can
    /// hold [LockKind::Shared] locks at the same time, hence there can be many
    /// simultaneous readers. But no other thread or process is allowed to
    /// write to the database file while one or more [LockKind::Shared] locks
    /// are active.
    Shared,

    /// A [LockKind::Reserved] lock means that the process is planning on
    /// writing to the database file at some point in the future but that it is
    /// currently just reading from the file. Only a single [LockKind::Reserved]
    /// lock may be active at one time, though multiple [LockKind::Shared]
    /// locks can coexist with a single [LockKind::Reserved] lock.
    Reserved,

    /// A [LockKind::Pending] lock means that the process holding the lock
    /// wants to write to the database as soon as possible and is just waiting
    /// on all current [LockKind::Shared] locks to clear so that it can get an
    /// [LockKind::Exclusive] lock. No new [LockKind::Shared] locks are
    /// permitted against the database if a [LockKind::Pending] lock is active.
    Pending,

    /// An [LockKind::Exclusive] lock is needed in order to write to the
    /// database file. Only one [LockKind::Exclusive] lock is allowed on the
    /// file and no other locks of any kind are allowed to coexist with an
    /// [LockKind::Exclusive] lock.
    Exclusive,
}

/// Register a virtual file system ([Vfs]) to SQLite.
pub fn register<F, V>(name: &str, vfs: V, as_default: bool) -> Result<(), RegisterError>
where
    F: DatabaseHandle<Error = V::Error>,
    V: Vfs<Handle = F> + Send + Sync + 'static,
{
    let io_methods = libsqlite3_sys::sqlite3_io_methods {
        iVersion: 2,
        xClose: Some(io::close::<V, F>),
        xRead: Some(io::read::<V, F>),
        xWrite: Some(io::write::<V, F>),
        xTruncate: Some(io::truncate::<V, F>),
        xSync: Some(io::sync::<V, F>),
        xFileSize: Some(io::file_size::<V, F>),
        xLock: Some(io::lock::<V, F>),
        xUnlock: Some(io::unlock::<V, F>),
        xCheckReservedLock: Some(io::check_reserved_lock::<V, F>),
        xFileControl: Some(io::file_control::<V, F>),
        xSectorSize: Some(io::sector_size::<F>),
        xDeviceCharacteristics: Some(io::device_characteristics::<V, F>),
        xShmMap: Some(io::shm_map::<V, F>),
        xShmLock: Some(io::shm_lock::<V, F>),
        xShmBarrier: Some(io::shm_barrier::<V, F>),
        xShmUnmap: Some(io::shm_unmap::<V, F>),
        xFetch: None,
        xUnfetch: None,
    };
    let name = CString::new(name).map_err(RegisterError::Nul)?;
    let name_ptr = name.as_ptr();
    let ptr = Box::into_raw(Box::new(State {
        name,
        vfs: Arc::new(vfs),
        io_methods,
        last_error: Arc::new(Mutex::new(None)),
        next_id: 0,
    }));
    let vfs = Box::into_raw(Box::new(libsqlite3_sys::sqlite3_vfs {
        iVersion: 2,
        szOsFile: size_of::<FileState<V, F>>() as i32,
        mxPathname: MAX_PATH_LENGTH as i32, // max path length supported by VFS
        pNext: null_mut(),
        zName: name_ptr,
        pAppData: ptr as _,
        xOpen: Some(vfs::open::<F, V>),
        xDelete: Some(vfs::delete::<V>),
        xAccess: Some(vfs::access::<V>),
        xFullPathname: Some(vfs::full_pathname::<V>),
        xDlOpen: Some(vfs::dlopen::<V>),
        xDlError: Some(vfs::dlerror::<V>),
        xDlSym: Some(vfs::dlsym::<V>),
        xDlClose: Some(vfs::dlclose::<V>),
        xRandomness: Some(vfs::randomness::<V>),
        xSleep: Some(vfs::sleep::<V>),
        xCurrentTime: Some(vfs::current_time::<V>),
        xGetLastError: Some(vfs::get_last_error::<V>),
        xCurrentTimeInt64: Some(vfs::current_time_int64::<V>),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }));

    let result = unsafe { libsqlite3_sys::sqlite3_vfs_register(vfs, as_default as i32) };
    if result != libsqlite3_sys::SQLITE_OK {
        return Err(RegisterError::Register(result));
    }

    // The registration is permanent; SQLite keeps referencing the boxed
    // state until process exit.
    Ok(())
}

const MAX_PATH_LENGTH: usize = 512;

impl OpenOptions {
    fn from_flags(flags: i32) -> Option<Self> {
        Some(OpenOptions {
            kind: OpenKind::from_flags(flags),
            access: OpenAccess::from_flags(flags)?,
            delete_on_close: flags & libsqlite3_sys::SQLITE_OPEN_DELETEONCLOSE > 0,
        })
    }

    fn to_flags(&self) -> i32 {
        self.kind.to_flags()
            | self.access.to_flags()
            | if self.delete_on_close {
                libsqlite3_sys::SQLITE_OPEN_DELETEONCLOSE
            } else {
                0
            }
    }
}

impl OpenKind {
    fn from_flags(flags: i32) -> Self {
        match flags {
            flags if flags & libsqlite3_sys::SQLITE_OPEN_MAIN_DB > 0 => Self::MainDb,
            flags if flags & libsqlite3_sys::SQLITE_OPEN_MAIN_JOURNAL > 0 => Self::MainJournal,
            flags if flags & libsqlite3_sys::SQLITE_OPEN_TEMP_DB > 0 => Self::TempDb,
            flags if flags & libsqlite3_sys::SQLITE_OPEN_TEMP_JOURNAL > 0 => Self::TempJournal,
            flags if flags & libsqlite3_sys::SQLITE_OPEN_TRANSIENT_DB > 0 => Self::TransientDb,
            flags if flags & libsqlite3_sys::SQLITE_OPEN_SUBJOURNAL > 0 => Self::SubJournal,
            flags if flags & libsqlite3_sys::SQLITE_OPEN_SUPER_JOURNAL > 0 => Self::SuperJournal,
            flags if flags & libsqlite3_sys::SQLITE_OPEN_WAL > 0 => Self::Wal,
            _ => Self::Unspecified,
        }
    }

    fn to_flags(self) -> i32 {
        match self {
            OpenKind::MainDb => libsqlite3_sys::SQLITE_OPEN_MAIN_DB,
            OpenKind::MainJournal => libsqlite3_sys::SQLITE_OPEN_MAIN_JOURNAL,
            OpenKind::TempDb => libsqlite3_sys::SQLITE_OPEN_TEMP_DB,
            OpenKind::TempJournal => libsqlite3_sys::SQLITE_OPEN_TEMP_JOURNAL,
            OpenKind::TransientDb => libsqlite3_sys::SQLITE_OPEN_TRANSIENT_DB,
            OpenKind::SubJournal => libsqlite3_sys::SQLITE_OPEN_SUBJOURNAL,
            OpenKind::SuperJournal => libsqlite3_sys::SQLITE_OPEN_SUPER_JOURNAL,
            OpenKind::Wal => libsqlite3_sys::SQLITE_OPEN_WAL,
            OpenKind::Unspecified => 0,
        }
    }
}

impl OpenAccess {
    fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            flags
                if (flags & libsqlite3_sys::SQLITE_OPEN_CREATE > 0)
                    && (flags & libsqlite3_sys::SQLITE_OPEN_EXCLUSIVE > 0) =>
            {
                Some(Self::CreateNew)
            }
            flags if flags & libsqlite3_sys::SQLITE_OPEN_CREATE > 0 => Some(Self::Create),
            flags if flags & libsqlite3_sys::SQLITE_OPEN_READWRITE > 0 => Some(Self::Write),
            _ => Some(Self::Read),
        }
    }

    fn to_flags(self) -> i32 {
        match self {
            OpenAccess::Read => libsqlite3_sys::SQLITE_OPEN_READONLY,
            OpenAccess::Write => libsqlite3_sys::SQLITE_OPEN_READWRITE,
            OpenAccess::Create => {
                libsqlite3_sys::SQLITE_OPEN_READWRITE | libsqlite3_sys::SQLITE_OPEN_CREATE
            }
            OpenAccess::CreateNew => {
                libsqlite3_sys::SQLITE_OPEN_READWRITE
                    | libsqlite3_sys::SQLITE_OPEN_CREATE
                    | libsqlite3_sys::SQLITE_OPEN_EXCLUSIVE
            }
        }
    }
}

impl LockKind {
    fn from_i32(lock: i32) -> Option<Self> {
        Some(match lock {
            libsqlite3_sys::SQLITE_LOCK_NONE => Self::None,
            libsqlite3_sys::SQLITE_LOCK_SHARED => Self::Shared,
            libsqlite3_sys::SQLITE_LOCK_RESERVED => Self::Reserved,
            libsqlite3_sys::SQLITE_LOCK_PENDING => Self::Pending,
            libsqlite3_sys::SQLITE_LOCK_EXCLUSIVE => Self::Exclusive,
            _ => return None,
        })
    }

    fn to_i32(self) -> i32 {
        match self {
            Self::None => libsqlite3_sys::SQLITE_LOCK_NONE,
            Self::Shared => libsqlite3_sys::SQLITE_LOCK_SHARED,
            Self::Reserved => libsqlite3_sys::SQLITE_LOCK_RESERVED,
            Self::Pending => libsqlite3_sys::SQLITE_LOCK_PENDING,
            Self::Exclusive => libsqlite3_sys::SQLITE_LOCK_EXCLUSIVE,
        }
    }
}

impl PartialOrd for LockKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.to_i32().partial_cmp(&other.to_i32())
    }
}

#[derive(Debug)]
pub enum RegisterError {
    Nul(std::ffi::NulError),
    Register(i32),
}

impl std::error::Error for RegisterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Nul(err) => Some(err),
            Self::Register(_) => None,
        }
    }
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nul(_) => f.write_str("interior nul byte in name found"),
            Self::Register(code) => {
                write!(f, "registering sqlite vfs failed with error code: {}", code)
            }
        }
    }
}

impl From<std::ffi::NulError> for RegisterError {
    fn from(err: std::ffi::NulError) -> Self {
        Self::Nul(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order() {
        assert!(LockKind::None < LockKind::Shared);
        assert!(LockKind::Shared < LockKind::Reserved);
        assert!(LockKind::Reserved < LockKind::Pending);
        assert!(LockKind::Pending < LockKind::Exclusive);
    }

    #[test]
    fn test_open_kind_fallback() {
        assert_eq!(
            OpenKind::from_flags(libsqlite3_sys::SQLITE_OPEN_CREATE),
            OpenKind::Unspecified
        );
        assert_eq!(
            OpenKind::from_flags(
                libsqlite3_sys::SQLITE_OPEN_CREATE | libsqlite3_sys::SQLITE_OPEN_WAL
            ),
            OpenKind::Wal
        );
    }
}
