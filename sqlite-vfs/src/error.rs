use std::ffi::CString;

use snafu::Snafu;

/// Secondary OS error codes reported through `xGetLastError`, matching the
/// errnos a disk-backed VFS would have produced.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENFILE: i32 = 23;
}

/// The error kinds a virtual file system can surface to SQLite.
///
/// Every kind maps to a primary SQLite result code (and, for the open and
/// delete paths, a secondary OS errno); backend-specific failures travel in
/// [Error::External].
#[derive(Debug, Snafu)]
pub enum Error<External = Box<dyn std::error::Error>> {
    #[snafu(display("read past end of file"))]
    ShortRead,

    #[snafu(display("database must be valid utf8 (received {name:?})"))]
    InvalidDbName {
        name: CString,
    },

    #[snafu(display("database {name} not found"))]
    NotFound {
        name: String,
    },

    #[snafu(display("database {name} already exists"))]
    AlreadyExists {
        name: String,
    },

    #[snafu(display("too many open databases"))]
    TooManyFiles,

    #[snafu(display("database {name} is still referenced by open handles"))]
    DeleteBusy {
        name: String,
    },

    #[snafu(display("cannot delete {name}: no such database"))]
    DeleteNotFound {
        name: String,
    },

    #[snafu(display("write-ahead log {name} opened before its database"))]
    WalWithoutDb {
        name: String,
    },

    #[snafu(display("out-of-order write at offset {offset}"))]
    WriteOutOfOrder {
        offset: u64,
    },

    #[snafu(display("invalid truncate size {size}"))]
    TruncateInvalid {
        size: u64,
    },

    #[snafu(display("invalid page size {size}"))]
    InvalidPageSize {
        size: u32,
    },

    #[snafu(display("changing page size is not supported"))]
    PageSizeChanged,

    #[snafu(display("only WAL journal mode is supported (requested {mode})"))]
    JournalModeNotWal {
        mode: String,
    },

    #[snafu(display("operation requires synchronous=OFF and journal_mode=WAL"))]
    NotInWalMode,

    #[snafu(display("out of memory"))]
    NoMem,

    #[snafu(display("path too long"))]
    PathTooLong,

    #[snafu(display("invalid open flags"))]
    InvalidOpenFlags,

    #[snafu(display("received null pointer"))]
    NullPtr,

    #[snafu(display("expected {name} arg"))]
    ExpectedArg {
        name: &'static str,
    },

    External {
        cause: External,
    },
}

impl<External> Error<External> {
    /// The primary SQLite result code for this kind, when the kind itself
    /// dictates one; call sites fall back to their own per-operation code
    /// otherwise.
    pub fn primary_code(&self) -> Option<i32> {
        match self {
            Error::ShortRead => Some(libsqlite3_sys::SQLITE_IOERR_SHORT_READ),
            Error::NotFound { .. } | Error::AlreadyExists { .. } | Error::TooManyFiles => {
                Some(libsqlite3_sys::SQLITE_CANTOPEN)
            }
            Error::DeleteBusy { .. } => Some(libsqlite3_sys::SQLITE_IOERR_DELETE),
            Error::DeleteNotFound { .. } => Some(libsqlite3_sys::SQLITE_IOERR_DELETE_NOENT),
            Error::WalWithoutDb { .. } => Some(libsqlite3_sys::SQLITE_CORRUPT),
            Error::WriteOutOfOrder { .. } => Some(libsqlite3_sys::SQLITE_IOERR_WRITE),
            Error::TruncateInvalid { .. } => Some(libsqlite3_sys::SQLITE_IOERR_TRUNCATE),
            Error::NoMem => Some(libsqlite3_sys::SQLITE_NOMEM),
            Error::InvalidPageSize { .. }
            | Error::PageSizeChanged
            | Error::JournalModeNotWal { .. }
            | Error::NotInWalMode => Some(libsqlite3_sys::SQLITE_IOERR),
            _ => None,
        }
    }

    /// The secondary OS error code reported through `xGetLastError`.
    pub fn os_errno(&self) -> Option<i32> {
        match self {
            Error::NotFound { .. } | Error::DeleteNotFound { .. } => Some(errno::ENOENT),
            Error::AlreadyExists { .. } => Some(errno::EEXIST),
            Error::TooManyFiles => Some(errno::ENFILE),
            Error::DeleteBusy { .. } => Some(errno::EBUSY),
            _ => None,
        }
    }
}

impl<T> From<T> for Error<T> {
    fn from(value: T) -> Self {
        Self::External { cause: value }
    }
}
