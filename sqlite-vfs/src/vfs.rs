use std::{
    ffi::{c_char, c_int, c_void, CStr, CString},
    sync::Arc,
    time::Duration,
};

use crate::{
    error::Error,
    state::{null_ptr_error, vfs_state, FileExt, FileState},
    DatabaseHandle, OpenOptions, Vfs, MAX_PATH_LENGTH,
};

/// Open a new file handle.
pub unsafe extern "C" fn open<F: DatabaseHandle<Error = V::Error>, V: Vfs<Handle = F>>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    z_name: *const c_char,
    p_file: *mut libsqlite3_sys::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let state = match vfs_state::<V>(p_vfs) {
        Ok(state) => state,
        Err(_) => return libsqlite3_sys::SQLITE_ERROR,
    };

    let name = if z_name.is_null() {
        None
    } else {
        match CStr::from_ptr(z_name).to_str() {
            Ok(name) => Some(name),
            Err(_) => {
                return state.set_last_error(
                    libsqlite3_sys::SQLITE_CANTOPEN,
                    Error::InvalidDbName {
                        name: CStr::from_ptr(z_name).into(),
                    },
                );
            }
        }
    };
    log::trace!("open z_name={:?} flags={}", name, flags);

    let opts = match OpenOptions::from_flags(flags) {
        Some(opts) => opts,
        None => {
            return state.set_last_error(libsqlite3_sys::SQLITE_CANTOPEN, Error::InvalidOpenFlags);
        }
    };

    if z_name.is_null() && !opts.delete_on_close {
        return state.set_last_error(libsqlite3_sys::SQLITE_CANTOPEN, Error::InvalidOpenFlags);
    }

    let out_file = match (p_file as *mut FileState<V, F>).as_mut() {
        Some(f) => f,
        None => {
            return state.set_last_error(libsqlite3_sys::SQLITE_CANTOPEN, Error::NullPtr);
        }
    };

    let mut powersafe_overwrite = true;
    if flags & libsqlite3_sys::SQLITE_OPEN_URI > 0 && name.is_some() {
        let param = b"psow\0";
        if libsqlite3_sys::sqlite3_uri_boolean(z_name, param.as_ptr() as *const c_char, 1) == 0 {
            powersafe_overwrite = false;
        }
    }

    let name = match name {
        Some(name) => name.to_string(),
        None => state.vfs.temporary_name(),
    };
    let file = match state.vfs.open(&name, opts.clone()) {
        Ok(f) => f,
        Err(err) => {
            let code = err
                .primary_code()
                .unwrap_or(libsqlite3_sys::SQLITE_CANTOPEN);
            return state.set_last_error(code, err);
        }
    };

    if let Some(p_out_flags) = p_out_flags.as_mut() {
        *p_out_flags = opts.to_flags();
    }

    out_file.base.pMethods = &state.io_methods;
    out_file.ext.write(FileExt {
        vfs: state.vfs.clone(),
        vfs_name: state.name.clone(),
        db_name: name,
        file,
        last_error: Arc::clone(&state.last_error),
        last_errno: 0,
        id: state.next_id,
        chunk_size: None,
        persist_wal: false,
        powersafe_overwrite,
    });
    state.next_id = state.next_id.overflowing_add(1).0;

    libsqlite3_sys::SQLITE_OK
}

/// Delete the file located at `z_path`. If the `sync_dir` argument is true,
/// ensure the file-system modifications are synced to disk before returning.
pub unsafe extern "C" fn delete<V: Vfs>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    z_path: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    let state = match vfs_state::<V>(p_vfs) {
        Ok(state) => state,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_DELETE,
    };

    let path = match CStr::from_ptr(z_path).to_str() {
        Ok(name) => name,
        Err(_) => {
            return state.set_last_error(
                libsqlite3_sys::SQLITE_ERROR,
                Error::InvalidDbName {
                    name: CStr::from_ptr(z_path).into(),
                },
            );
        }
    };
    log::trace!("delete name={}", path);

    match state.vfs.delete(path) {
        Ok(_) => libsqlite3_sys::SQLITE_OK,
        Err(err) => {
            let code = err
                .primary_code()
                .unwrap_or(libsqlite3_sys::SQLITE_IOERR_DELETE);
            state.set_last_error(code, err)
        }
    }
}

/// Test for access permissions. Return true if the requested permission is
/// available, or false otherwise.
pub unsafe extern "C" fn access<V: Vfs>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    z_path: *const c_char,
    flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let state = match vfs_state::<V>(p_vfs) {
        Ok(state) => state,
        Err(_) => return libsqlite3_sys::SQLITE_ERROR,
    };

    let path = match CStr::from_ptr(z_path).to_str() {
        Ok(name) => name,
        Err(_) => {
            log::warn!(
                "access failed: database must be valid utf8 (received: {:?})",
                CStr::from_ptr(z_path)
            );

            if let Some(p_res_out) = p_res_out.as_mut() {
                *p_res_out = false as i32;
            }

            return libsqlite3_sys::SQLITE_OK;
        }
    };
    log::trace!("access z_name={} flags={}", path, flags);

    let result = match flags {
        libsqlite3_sys::SQLITE_ACCESS_EXISTS => state.vfs.exists(path),
        libsqlite3_sys::SQLITE_ACCESS_READ => state.vfs.access(path, false),
        libsqlite3_sys::SQLITE_ACCESS_READWRITE => state.vfs.access(path, true),
        _ => return libsqlite3_sys::SQLITE_IOERR_ACCESS,
    };

    if let Err(err) = result.and_then(|ok| {
        let p_res_out: &mut c_int = p_res_out.as_mut().ok_or_else(null_ptr_error)?;
        *p_res_out = ok as i32;
        Ok(())
    }) {
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_ACCESS, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Populate buffer `z_out` with the full canonical pathname corresponding to
/// the pathname in `z_path`. `z_out` is guaranteed to point to a buffer of at
/// least (mxPathname+1) bytes.
pub unsafe extern "C" fn full_pathname<V: Vfs>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    z_path: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    let state = match vfs_state::<V>(p_vfs) {
        Ok(state) => state,
        Err(_) => return libsqlite3_sys::SQLITE_ERROR,
    };

    let path = match CStr::from_ptr(z_path).to_str() {
        Ok(name) => name,
        Err(_) => {
            return state.set_last_error(
                libsqlite3_sys::SQLITE_ERROR,
                Error::InvalidDbName {
                    name: CStr::from_ptr(z_path).into(),
                },
            );
        }
    };
    log::trace!("full_pathname name={}", path);

    let name = match state
        .vfs
        .full_pathname(path)
        .and_then(|name| CString::new(name.to_string()).map_err(|_| Error::PathTooLong))
    {
        Ok(name) => name,
        Err(err) => return state.set_last_error(libsqlite3_sys::SQLITE_ERROR, err),
    };

    let name = name.to_bytes_with_nul();
    if name.len() > n_out as usize || name.len() > MAX_PATH_LENGTH {
        return state.set_last_error(libsqlite3_sys::SQLITE_CANTOPEN, Error::PathTooLong);
    }
    let out = std::slice::from_raw_parts_mut(z_out as *mut u8, name.len());
    out.copy_from_slice(name);

    libsqlite3_sys::SQLITE_OK
}

/// Open the dynamic library located at `z_path` and return a handle. Loadable
/// extensions are not supported.
pub unsafe extern "C" fn dlopen<V>(
    _p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    _z_path: *const c_char,
) -> *mut c_void {
    log::trace!("dlopen");

    std::ptr::null_mut()
}

/// Populate the buffer `z_err_msg` (size `n_byte` bytes) with a human readable
/// utf-8 string describing the most recent error encountered associated with
/// dynamic libraries.
pub unsafe extern "C" fn dlerror<V>(
    _p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) {
    log::trace!("dlerror");

    let msg = concat!("Loadable extensions are not supported", "\0");
    libsqlite3_sys::sqlite3_snprintf(n_byte, z_err_msg, msg.as_ptr() as _);
}

/// Return a pointer to the symbol `z_sym` in the dynamic library `p_handle`.
pub unsafe extern "C" fn dlsym<V>(
    _p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    _p: *mut c_void,
    _z_sym: *const c_char,
) -> Option<
    unsafe extern "C" fn(*mut libsqlite3_sys::sqlite3_vfs, *mut c_void, *const c_char),
> {
    log::trace!("dlsym");

    None
}

/// Close the dynamic library handle `p_handle`.
pub unsafe extern "C" fn dlclose<V>(
    _p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    _p_handle: *mut c_void,
) {
    log::trace!("dlclose");
}

/// Populate the buffer pointed to by `z_buf_out` with `n_byte` bytes of random
/// data.
pub unsafe extern "C" fn randomness<V: Vfs>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    n_byte: c_int,
    z_buf_out: *mut c_char,
) -> c_int {
    log::trace!("randomness");

    let bytes = std::slice::from_raw_parts_mut(z_buf_out as *mut u8, n_byte as usize);
    let state = match vfs_state::<V>(p_vfs) {
        Ok(state) => state,
        Err(_) => return 0,
    };

    state.vfs.random(bytes);
    bytes.len() as c_int
}

/// Sleep for `n_micro` microseconds. Return the number of microseconds
/// actually slept.
pub unsafe extern "C" fn sleep<V: Vfs>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    n_micro: c_int,
) -> c_int {
    log::trace!("sleep");

    let state = match vfs_state::<V>(p_vfs) {
        Ok(state) => state,
        Err(_) => return libsqlite3_sys::SQLITE_ERROR,
    };
    state
        .vfs
        .sleep(Duration::from_micros(n_micro as u64))
        .as_micros() as c_int
}

/// Return the current time as a Julian Day number in `p_time_out`.
pub unsafe extern "C" fn current_time<V>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    p_time_out: *mut f64,
) -> c_int {
    log::trace!("current_time");

    let mut i = 0i64;
    current_time_int64::<V>(p_vfs, &mut i);

    *p_time_out = i as f64 / 86400000.0;
    libsqlite3_sys::SQLITE_OK
}

pub unsafe extern "C" fn current_time_int64<V>(
    _p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    p: *mut i64,
) -> i32 {
    log::trace!("current_time_int64");

    const UNIX_EPOCH: i64 = 24405875 * 8640000;
    let now = time::OffsetDateTime::now_utc().unix_timestamp() * 1000 + UNIX_EPOCH;

    *p = now;
    libsqlite3_sys::SQLITE_OK
}

/// Return the most recent OS error code recorded by this VFS instance and,
/// when a buffer is provided, copy the matching message into it.
pub unsafe extern "C" fn get_last_error<V: Vfs>(
    p_vfs: *mut libsqlite3_sys::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) -> c_int {
    let state = match vfs_state::<V>(p_vfs) {
        Ok(state) => state,
        Err(_) => return 0,
    };
    let last_error = match state.last_error.lock() {
        Ok(last_error) => last_error,
        Err(_) => return 0,
    };
    if let Some(err) = last_error.as_ref() {
        if n_byte > 0 && !z_err_msg.is_null() {
            if let Ok(msg) = CString::new(err.message.clone()) {
                let msg = msg.to_bytes_with_nul();
                if msg.len() <= n_byte as usize {
                    let out = std::slice::from_raw_parts_mut(z_err_msg as *mut u8, msg.len());
                    out.copy_from_slice(msg);
                }
            }
        }

        return err.errno;
    }

    0
}
