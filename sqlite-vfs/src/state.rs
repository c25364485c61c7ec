use std::{
    ffi::CString,
    mem::MaybeUninit,
    sync::{Arc, Mutex},
};

use crate::{DatabaseHandle, Vfs};

/// The most recent error recorded by any entry point of a VFS instance,
/// reported through `xGetLastError`.
pub struct LastError {
    pub errno: i32,
    pub message: String,
}

pub struct State<V: Vfs> {
    pub name: CString,
    pub vfs: Arc<V>,
    pub io_methods: libsqlite3_sys::sqlite3_io_methods,
    pub last_error: Arc<Mutex<Option<LastError>>>,
    pub next_id: usize,
}

#[repr(C)]
pub struct FileState<V: Vfs, F: DatabaseHandle> {
    pub base: libsqlite3_sys::sqlite3_file,
    pub ext: MaybeUninit<FileExt<V, F>>,
}

#[repr(C)]
pub struct FileExt<V: Vfs, F: DatabaseHandle> {
    pub vfs: Arc<V>,
    pub vfs_name: CString,
    pub db_name: String,
    pub file: F,
    /// The last error; shared with the VFS.
    pub last_error: Arc<Mutex<Option<LastError>>>,
    /// The last error number of this file/connection (not shared with the VFS).
    pub last_errno: i32,
    pub id: usize,
    pub chunk_size: Option<usize>,
    pub persist_wal: bool,
    pub powersafe_overwrite: bool,
}

impl<V: Vfs> State<V> {
    pub(crate) fn set_last_error(&self, no: i32, err: crate::error::Error<V::Error>) -> i32 {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(LastError {
                errno: err.os_errno().unwrap_or(0),
                message: err.to_string(),
            });
        }
        no
    }
}

impl<V: Vfs, F: DatabaseHandle> FileExt<V, F> {
    pub(crate) fn set_last_error(&mut self, no: i32, err: crate::error::Error<V::Error>) -> i32 {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(LastError {
                errno: err.os_errno().unwrap_or(0),
                message: err.to_string(),
            });
        }
        self.last_errno = no;
        no
    }
}

pub(crate) fn null_ptr_error<External>() -> crate::error::Error<External> {
    crate::error::Error::NullPtr
}

pub unsafe fn vfs_state<'a, V: Vfs>(
    ptr: *mut libsqlite3_sys::sqlite3_vfs,
) -> Result<&'a mut State<V>, crate::error::Error<V::Error>> {
    let vfs: &mut libsqlite3_sys::sqlite3_vfs = ptr.as_mut().ok_or_else(null_ptr_error)?;
    let state = (vfs.pAppData as *mut State<V>)
        .as_mut()
        .ok_or_else(null_ptr_error)?;
    Ok(state)
}

pub unsafe fn file_state<'a, V: Vfs, F: DatabaseHandle<Error = V::Error>>(
    ptr: *mut libsqlite3_sys::sqlite3_file,
) -> Result<&'a mut FileExt<V, F>, crate::error::Error<V::Error>> {
    let f = (ptr as *mut FileState<V, F>)
        .as_mut()
        .ok_or_else(null_ptr_error)?;
    let ext = f.ext.assume_init_mut();
    Ok(ext)
}
