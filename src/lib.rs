//! An in-memory SQLite virtual file system.
//!
//! `memlite` keeps every database file (main database, write-ahead log,
//! rollback journal, temp files) in process memory while satisfying the
//! full filesystem contract SQLite expects from a real disk: page-aligned
//! ordered writes, a shared-memory WAL index with an 8-slot lock table, and
//! the WAL-only journaling discipline of a replicated state machine. Two
//! bulk primitives, [MemVfs::file_read] and [MemVfs::file_write], expose the
//! logical file contents so a consensus layer can snapshot and restore
//! state.
//!
//! ```no_run
//! let vfs = memlite::MemVfs::new();
//! vfs.register("memlite", false).unwrap();
//!
//! let conn = rusqlite::Connection::open_with_flags_and_vfs(
//!     "app.db",
//!     rusqlite::OpenFlags::default(),
//!     "memlite",
//! )
//! .unwrap();
//! conn.execute_batch("PRAGMA synchronous=OFF").unwrap();
//! conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())).unwrap();
//! ```

pub mod content;
pub mod error;
pub mod format;
pub mod handle;
pub mod page;
pub mod shm;
pub mod vfs;
pub mod wal;

pub use error::{Error, VfsError};
pub use handle::MemHandle;
pub use vfs::MemVfs;
