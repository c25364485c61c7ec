use snafu::Snafu;

/// Backend-specific failures; everything the host engine must act on is
/// expressed through the bridge's error kinds instead.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("malformed database header ({len} bytes)"))]
    BadDbHeader { len: usize },

    #[snafu(display("malformed WAL header ({len} bytes)"))]
    BadWalHeader { len: usize },

    #[snafu(display("invalid page size {size}"))]
    BadPageSize { size: u32 },

    #[snafu(display("snapshot is not a whole number of pages ({len} bytes)"))]
    BadDbSnapshot { len: usize },

    #[snafu(display("snapshot is not a whole number of frames ({len} bytes)"))]
    BadWalSnapshot { len: usize },

    #[snafu(display("shared memory is only available on a main database file"))]
    ShmUnsupported,

    #[snafu(display("shared memory has not been mapped yet"))]
    ShmNotMapped,
}

/// The error type of every VFS operation: a bridge error kind, possibly
/// wrapping a backend failure.
pub type VfsError = sqlite_vfs::error::Error<Error>;
