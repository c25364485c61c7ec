use std::ffi::{c_char, c_int, c_void, CStr};
use std::mem::{self, MaybeUninit};
use std::ptr::null_mut;
use std::slice;

use crate::error::Error;
use crate::state::{file_state, null_ptr_error, FileState};
use crate::{DatabaseHandle, LockKind, ShmLockMode, Vfs};

/// Close a file.
pub unsafe extern "C" fn close<V: Vfs, F: DatabaseHandle>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
) -> c_int {
    if let Some(f) = (p_file as *mut FileState<V, F>).as_mut() {
        let ext = mem::replace(&mut f.ext, MaybeUninit::uninit());
        // Extract the value to drop it; the handle releases its reference on
        // the underlying file (and deletes it when it was opened
        // delete-on-close) as part of its Drop impl.
        let ext = ext.assume_init();
        log::trace!("[{}] close ({})", ext.id, ext.db_name);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Read data from a file.
pub unsafe extern "C" fn read<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    z_buf: *mut c_void,
    i_amt: c_int,
    i_ofst: libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_READ,
    };
    log::trace!(
        "[{}] read offset={} len={} ({})",
        state.id,
        i_ofst,
        i_amt,
        state.db_name
    );

    let out = slice::from_raw_parts_mut(z_buf as *mut u8, i_amt as usize);
    if let Err(err) = state.file.read_exact_at(out, i_ofst as u64) {
        if let Error::ShortRead = err {
            return libsqlite3_sys::SQLITE_IOERR_SHORT_READ;
        }
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_READ, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Write data to a file.
pub unsafe extern "C" fn write<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    z: *const c_void,
    i_amt: c_int,
    i_ofst: libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_WRITE,
    };
    log::trace!(
        "[{}] write offset={} len={} ({})",
        state.id,
        i_ofst,
        i_amt,
        state.db_name
    );

    let data = slice::from_raw_parts(z as *const u8, i_amt as usize);
    if let Err(err) = state.file.write_all_at(data, i_ofst as u64) {
        let code = err
            .primary_code()
            .unwrap_or(libsqlite3_sys::SQLITE_IOERR_WRITE);
        return state.set_last_error(code, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Truncate a file.
pub unsafe extern "C" fn truncate<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    size: libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_TRUNCATE,
    };

    let size: u64 = if let Some(chunk_size) = state.chunk_size {
        (((size as usize + chunk_size - 1) / chunk_size) * chunk_size) as u64
    } else {
        size as u64
    };

    log::trace!("[{}] truncate size={} ({})", state.id, size, state.db_name);

    if let Err(err) = state.file.set_len(size) {
        let code = err
            .primary_code()
            .unwrap_or(libsqlite3_sys::SQLITE_IOERR_TRUNCATE);
        return state.set_last_error(code, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Persist changes to a file.
pub unsafe extern "C" fn sync<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    flags: c_int,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_FSYNC,
    };
    log::trace!("[{}] sync ({})", state.id, state.db_name);

    if let Err(err) = state
        .file
        .sync(flags & libsqlite3_sys::SQLITE_SYNC_DATAONLY > 0)
    {
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_FSYNC, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Return the current file-size of a file.
pub unsafe extern "C" fn file_size<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    p_size: *mut libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_FSTAT,
    };
    log::trace!("[{}] file_size ({})", state.id, state.db_name);

    if let Err(err) = state.file.size().and_then(|n| {
        let p_size: &mut libsqlite3_sys::sqlite3_int64 =
            p_size.as_mut().ok_or_else(null_ptr_error::<V::Error>)?;
        *p_size = n as libsqlite3_sys::sqlite3_int64;
        Ok(())
    }) {
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_FSTAT, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Lock a file.
pub unsafe extern "C" fn lock<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    e_lock: c_int,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_LOCK,
    };

    let lock = match LockKind::from_i32(e_lock) {
        Some(lock) => lock,
        None => return libsqlite3_sys::SQLITE_IOERR_LOCK,
    };
    log::trace!("[{}] lock={:?} ({})", state.id, lock, state.db_name);

    match state.file.lock(lock) {
        Ok(true) => libsqlite3_sys::SQLITE_OK,
        Ok(false) => libsqlite3_sys::SQLITE_BUSY,
        Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_LOCK, err),
    }
}

/// Unlock a file.
pub unsafe extern "C" fn unlock<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    e_lock: c_int,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_UNLOCK,
    };

    let lock = match LockKind::from_i32(e_lock) {
        Some(lock) => lock,
        None => return libsqlite3_sys::SQLITE_IOERR_UNLOCK,
    };
    log::trace!("[{}] unlock={:?} ({})", state.id, lock, state.db_name);

    match state.file.unlock(lock) {
        Ok(true) => libsqlite3_sys::SQLITE_OK,
        Ok(false) => libsqlite3_sys::SQLITE_BUSY,
        Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_UNLOCK, err),
    }
}

/// Check if another file-handle holds a [LockKind::Reserved] lock on a file.
pub unsafe extern "C" fn check_reserved_lock<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_CHECKRESERVEDLOCK,
    };
    log::trace!("[{}] check_reserved_lock ({})", state.id, state.db_name);

    if let Err(err) = state.file.reserved().and_then(|is_reserved| {
        let p_res_out: &mut c_int = p_res_out.as_mut().ok_or_else(null_ptr_error)?;
        *p_res_out = is_reserved as c_int;
        Ok(())
    }) {
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_CHECKRESERVEDLOCK, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// File control method. For custom operations on a mem-file.
pub unsafe extern "C" fn file_control<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_NOTFOUND,
    };
    log::trace!("[{}] file_control op={} ({})", state.id, op, state.db_name);

    match op {
        // Handled by SQLite itself before reaching a custom VFS.
        libsqlite3_sys::SQLITE_FCNTL_FILE_POINTER
        | libsqlite3_sys::SQLITE_FCNTL_VFS_POINTER
        | libsqlite3_sys::SQLITE_FCNTL_JOURNAL_POINTER
        | libsqlite3_sys::SQLITE_FCNTL_DATA_VERSION
        | libsqlite3_sys::SQLITE_FCNTL_RESERVE_BYTES => libsqlite3_sys::SQLITE_NOTFOUND,

        // Used for debugging. Write current state of the lock into (int)pArg.
        libsqlite3_sys::SQLITE_FCNTL_LOCKSTATE => match state.file.current_lock() {
            Ok(lock) => {
                if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                    *p_arg = lock.to_i32();
                }
                libsqlite3_sys::SQLITE_OK
            }
            Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_ERROR, err),
        },

        // Relevant for proxy-type locking. Not implemented.
        libsqlite3_sys::SQLITE_FCNTL_GET_LOCKPROXYFILE
        | libsqlite3_sys::SQLITE_FCNTL_SET_LOCKPROXYFILE => libsqlite3_sys::SQLITE_NOTFOUND,

        // Write last error number into (int)pArg.
        libsqlite3_sys::SQLITE_FCNTL_LAST_ERRNO => {
            if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                *p_arg = state.last_errno;
            }
            libsqlite3_sys::SQLITE_OK
        }

        // A hint of how large the database file will grow during the current
        // transaction. A page store only ever grows by appending pages, so
        // there is nothing to pre-allocate.
        libsqlite3_sys::SQLITE_FCNTL_SIZE_HINT => libsqlite3_sys::SQLITE_NOTFOUND,

        // Request that the file grows and shrinks in chunks of the given
        // size.
        libsqlite3_sys::SQLITE_FCNTL_CHUNK_SIZE => {
            let chunk_size = match (p_arg as *mut i32)
                .as_ref()
                .cloned()
                .and_then(|s| usize::try_from(s).ok())
            {
                Some(chunk_size) => chunk_size,
                None => {
                    return state.set_last_error(
                        libsqlite3_sys::SQLITE_NOTFOUND,
                        Error::ExpectedArg { name: "chunk_size" },
                    );
                }
            };

            if let Err(err) = state.file.set_chunk_size(chunk_size) {
                return state.set_last_error(libsqlite3_sys::SQLITE_ERROR, err);
            }

            state.chunk_size = Some(chunk_size);

            libsqlite3_sys::SQLITE_OK
        }

        // Windows-VFS-only retry configuration. Not implemented.
        libsqlite3_sys::SQLITE_FCNTL_WIN32_AV_RETRY => libsqlite3_sys::SQLITE_NOTFOUND,

        // Enable or disable the persistent WAL setting.
        libsqlite3_sys::SQLITE_FCNTL_PERSIST_WAL => {
            if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                if *p_arg < 0 {
                    // query current setting
                    *p_arg = state.persist_wal as i32;
                } else {
                    state.persist_wal = *p_arg == 1;
                }
            };

            libsqlite3_sys::SQLITE_OK
        }

        // Indicate that the entire database file will be overwritten by the
        // current transaction. Not implemented.
        libsqlite3_sys::SQLITE_FCNTL_OVERWRITE => libsqlite3_sys::SQLITE_NOTFOUND,

        // Used to obtain the names of all VFSes in the VFS stack.
        libsqlite3_sys::SQLITE_FCNTL_VFSNAME => {
            if let Some(p_arg) = (p_arg as *mut *const c_char).as_mut() {
                // SQLite frees the name with sqlite3_free, so it has to be
                // allocated by the SQLite allocator.
                let name = libsqlite3_sys::sqlite3_mprintf(
                    b"%s\0".as_ptr() as *const c_char,
                    state.vfs_name.as_ptr(),
                );
                if !name.is_null() {
                    *p_arg = name;
                }
            };

            libsqlite3_sys::SQLITE_OK
        }

        // Set or query the persistent "powersafe-overwrite" or "PSOW" setting.
        libsqlite3_sys::SQLITE_FCNTL_POWERSAFE_OVERWRITE => {
            if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                if *p_arg < 0 {
                    // query current setting
                    *p_arg = state.powersafe_overwrite as i32;
                } else {
                    state.powersafe_overwrite = *p_arg == 1;
                }
            };

            libsqlite3_sys::SQLITE_OK
        }

        // Intercept PRAGMA statements. `pArg` is an array of three C strings:
        // an output error message, the pragma name, and the optional value.
        libsqlite3_sys::SQLITE_FCNTL_PRAGMA => {
            let fnctl = p_arg as *mut *const c_char;
            if fnctl.is_null() {
                return libsqlite3_sys::SQLITE_NOTFOUND;
            }

            let name_ptr = *fnctl.add(1);
            if name_ptr.is_null() {
                return libsqlite3_sys::SQLITE_NOTFOUND;
            }
            let name = match CStr::from_ptr(name_ptr).to_str() {
                Ok(name) => name,
                Err(_) => return libsqlite3_sys::SQLITE_NOTFOUND,
            };

            let value_ptr = *fnctl.add(2);
            let value = if value_ptr.is_null() {
                None
            } else {
                match CStr::from_ptr(value_ptr).to_str() {
                    Ok(value) => Some(value),
                    Err(_) => return libsqlite3_sys::SQLITE_NOTFOUND,
                }
            };

            log::trace!(
                "[{}] pragma name={} value={:?} ({})",
                state.id,
                name,
                value,
                state.db_name
            );

            match state.file.pragma(name, value) {
                // Tell SQLite to go on with its own pragma processing; an
                // SQLITE_OK here would stop the pragma from taking effect.
                Ok(()) => libsqlite3_sys::SQLITE_NOTFOUND,
                Err(err) => {
                    let code = err.primary_code().unwrap_or(libsqlite3_sys::SQLITE_IOERR);
                    state.set_last_error(code, err)
                }
            }
        }

        // Provides the connection's busy-handler callback to the VFS.
        // Not implemented.
        libsqlite3_sys::SQLITE_FCNTL_BUSYHANDLER => libsqlite3_sys::SQLITE_NOTFOUND,

        // Generate a temporary filename.
        libsqlite3_sys::SQLITE_FCNTL_TEMPFILENAME => libsqlite3_sys::SQLITE_NOTFOUND,

        // Query or set the maximum number of bytes used for memory-mapped
        // I/O. There is no mmap here.
        libsqlite3_sys::SQLITE_FCNTL_MMAP_SIZE => libsqlite3_sys::SQLITE_NOTFOUND,

        // Advisory information about what the higher layers of the SQLite
        // stack are doing.
        libsqlite3_sys::SQLITE_FCNTL_TRACE => {
            let trace = CStr::from_ptr(p_arg as *const c_char);
            log::trace!("{}", trace.to_string_lossy());
            libsqlite3_sys::SQLITE_OK
        }

        // Check whether or not the file has been renamed, moved, or deleted
        // since it was first opened.
        libsqlite3_sys::SQLITE_FCNTL_HAS_MOVED => match state.file.moved() {
            Ok(moved) => {
                if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                    *p_arg = moved as i32;
                }
                libsqlite3_sys::SQLITE_OK
            }
            Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_ERROR, err),
        },

        // Sent to the VFS immediately before the xSync method is invoked on a
        // database file descriptor. Silently ignored.
        libsqlite3_sys::SQLITE_FCNTL_SYNC => libsqlite3_sys::SQLITE_OK,

        // Sent to the VFS after a transaction has been committed immediately
        // but before the database is unlocked. Silently ignored.
        libsqlite3_sys::SQLITE_FCNTL_COMMIT_PHASETWO => libsqlite3_sys::SQLITE_OK,

        // Sent before and after a checkpoint copies pages from the WAL into
        // the database. Silently ignored.
        libsqlite3_sys::SQLITE_FCNTL_CKPT_START | libsqlite3_sys::SQLITE_FCNTL_CKPT_DONE => {
            libsqlite3_sys::SQLITE_OK
        }

        // Detect whether there is a database client in another process with a
        // wal-mode transaction open. Unix-specific, not implemented.
        libsqlite3_sys::SQLITE_FCNTL_EXTERNAL_READER => libsqlite3_sys::SQLITE_NOTFOUND,

        _ => libsqlite3_sys::SQLITE_NOTFOUND,
    }
}

/// Return the sector-size in bytes for a file.
pub unsafe extern "C" fn sector_size<F>(_p_file: *mut libsqlite3_sys::sqlite3_file) -> c_int {
    log::trace!("sector_size");

    // Match the smallest legal page size, so the backend never forces pages
    // larger than what the caller configured.
    512
}

/// Return the device characteristic flags supported by a file.
pub unsafe extern "C" fn device_characteristics<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
) -> c_int {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return 0,
    };

    log::trace!("[{}] device_characteristics", state.id);

    if state.powersafe_overwrite {
        libsqlite3_sys::SQLITE_IOCAP_POWERSAFE_OVERWRITE
    } else {
        0
    }
}

/// Create a shared memory file mapping.
pub unsafe extern "C" fn shm_map<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    region_ix: i32,
    region_size: i32,
    b_extend: i32,
    pp: *mut *mut c_void,
) -> i32 {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_SHMMAP,
    };
    log::trace!(
        "[{}] shm_map region={} size={} extend={} ({})",
        state.id,
        region_ix,
        region_size,
        b_extend,
        state.db_name
    );

    if region_ix < 0 || region_size <= 0 {
        return libsqlite3_sys::SQLITE_IOERR_SHMMAP;
    }

    match state
        .file
        .shm_map(region_ix as u32, region_size as usize, b_extend != 0)
    {
        Ok(Some(region)) => {
            *pp = region.as_ptr() as *mut c_void;
            libsqlite3_sys::SQLITE_OK
        }
        Ok(None) => {
            *pp = null_mut();
            libsqlite3_sys::SQLITE_OK
        }
        Err(err) => {
            let code = err
                .primary_code()
                .unwrap_or(libsqlite3_sys::SQLITE_IOERR_SHMMAP);
            state.set_last_error(code, err)
        }
    }
}

/// Perform locking on a shared-memory segment.
pub unsafe extern "C" fn shm_lock<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    offset: i32,
    n: i32,
    flags: i32,
) -> i32 {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_SHMLOCK,
    };
    let locking = flags & libsqlite3_sys::SQLITE_SHM_LOCK > 0;
    let exclusive = flags & libsqlite3_sys::SQLITE_SHM_EXCLUSIVE > 0;
    log::trace!(
        "[{}] shm_lock offset={} n={} lock={} exclusive={} (flags={}) ({})",
        state.id,
        offset,
        n,
        locking,
        exclusive,
        flags,
        state.db_name
    );

    if offset < 0 || n <= 0 || offset + n > 8 {
        return libsqlite3_sys::SQLITE_IOERR_SHMLOCK;
    }

    let range = offset as u8..(offset + n) as u8;
    let mode = if exclusive {
        ShmLockMode::Exclusive
    } else {
        ShmLockMode::Shared
    };

    if locking {
        match state.file.shm_lock(range, mode) {
            Ok(true) => libsqlite3_sys::SQLITE_OK,
            Ok(false) => libsqlite3_sys::SQLITE_BUSY,
            Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_SHMLOCK, err),
        }
    } else {
        match state.file.shm_unlock(range, mode) {
            Ok(()) => libsqlite3_sys::SQLITE_OK,
            Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_SHMLOCK, err),
        }
    }
}

/// Memory barrier operation on shared memory.
pub unsafe extern "C" fn shm_barrier<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
) {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return,
    };
    log::trace!("[{}] shm_barrier ({})", state.id, state.db_name);

    state.file.shm_barrier();
}

/// Unmap a shared memory segment.
pub unsafe extern "C" fn shm_unmap<V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    delete_flags: i32,
) -> i32 {
    let state = match file_state::<V, F>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_SHMMAP,
    };
    log::trace!(
        "[{}] shm_unmap delete={} ({})",
        state.id,
        delete_flags == 1,
        state.db_name
    );

    match state.file.shm_unmap(delete_flags == 1) {
        Ok(()) => libsqlite3_sys::SQLITE_OK,
        Err(err) => {
            let code = err
                .primary_code()
                .unwrap_or(libsqlite3_sys::SQLITE_IOERR_SHMMAP);
            state.set_last_error(code, err)
        }
    }
}
