//! The set of logical files living inside one VFS instance.
//!
//! A [Content] is the authoritative in-memory representation of one file;
//! handles reference it by name and share it. The [Registry] owns every
//! content, enforces the open protocol and the cross-file rules (a WAL
//! requires its main database, open files cannot be deleted, at most
//! [MAX_CONTENTS] files per instance).

use std::collections::HashMap;
use std::ptr::NonNull;

use sqlite_vfs::{error::Error, LockKind, OpenAccess, OpenKind, OpenOptions, ShmLockMode};

use crate::error::Error as BackendError;
use crate::format;
use crate::page::PageStore;
use crate::shm::{Shm, ShmHandle};
use crate::wal::WalStore;

type Result<T> = std::result::Result<T, Error<BackendError>>;

/// Hard cap on the number of live contents per VFS instance.
pub const MAX_CONTENTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    MainDb,
    Wal,
    Journal,
    Temp,
    Other,
}

impl FileKind {
    /// Pick the content kind for a new file: the open flags decide when they
    /// carry a type, the filename suffix otherwise.
    pub fn resolve(kind: OpenKind, name: &str) -> FileKind {
        match kind {
            OpenKind::MainDb => FileKind::MainDb,
            OpenKind::Wal => FileKind::Wal,
            OpenKind::MainJournal | OpenKind::TempJournal | OpenKind::SubJournal => {
                FileKind::Journal
            }
            OpenKind::TempDb | OpenKind::TransientDb => FileKind::Temp,
            OpenKind::SuperJournal => FileKind::Other,
            OpenKind::Unspecified => Self::from_name(name),
        }
    }

    fn from_name(name: &str) -> FileKind {
        if name.ends_with("-wal") {
            FileKind::Wal
        } else if name.ends_with("-journal") {
            FileKind::Journal
        } else {
            FileKind::MainDb
        }
    }
}

/// Byte-granular growable buffer backing journal, temp and other files.
#[derive(Default)]
struct ByteBuf(Vec<u8>);

impl ByteBuf {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        if end > self.0.len() {
            self.0
                .try_reserve(end - self.0.len())
                .map_err(|_| Error::<BackendError>::NoMem)?;
            self.0.resize(end, 0);
        }
        self.0[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset >= self.0.len() as u64 {
            buf.fill(0);
            return Err(Error::ShortRead);
        }
        let available = &self.0[offset as usize..];
        if available.len() < buf.len() {
            buf[..available.len()].copy_from_slice(available);
            buf[available.len()..].fill(0);
            return Err(Error::ShortRead);
        }
        buf.copy_from_slice(&available[..buf.len()]);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let size = size as usize;
        if size > self.0.len() {
            self.0
                .try_reserve(size - self.0.len())
                .map_err(|_| Error::<BackendError>::NoMem)?;
        }
        self.0.resize(size, 0);
        Ok(())
    }
}

enum Body {
    Pages(PageStore),
    Wal(WalStore),
    Bytes(ByteBuf),
}

pub struct Content {
    kind: FileKind,
    body: Body,
    refcount: usize,
    delete_on_close: bool,
    shm: Option<Shm>,
    /// Handles currently holding a RESERVED or stronger lock.
    reserved_handles: usize,
    /// `PRAGMA journal_mode=WAL` has been seen (or a snapshot was restored).
    wal_mode: bool,
    /// `PRAGMA synchronous=OFF` has been seen.
    sync_off: bool,
}

impl Content {
    fn new(kind: FileKind) -> Content {
        let body = match kind {
            FileKind::MainDb => Body::Pages(PageStore::default()),
            FileKind::Wal => Body::Wal(WalStore::default()),
            FileKind::Journal | FileKind::Temp | FileKind::Other => {
                Body::Bytes(ByteBuf::default())
            }
        };
        Content {
            kind,
            body,
            refcount: 0,
            delete_on_close: false,
            shm: None,
            reserved_handles: 0,
            wal_mode: false,
            sync_off: false,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn page_size(&self) -> Option<u32> {
        match &self.body {
            Body::Pages(pages) => pages.page_size(),
            Body::Wal(wal) => wal.page_size(),
            Body::Bytes(_) => None,
        }
    }

    pub fn file_size(&self) -> u64 {
        match &self.body {
            Body::Pages(pages) => pages.len_bytes(),
            Body::Wal(wal) => wal.len_bytes(),
            Body::Bytes(bytes) => bytes.0.len() as u64,
        }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &self.body {
            Body::Pages(pages) => pages.read(offset, buf),
            Body::Wal(wal) => wal.read(offset, buf),
            Body::Bytes(bytes) => bytes.read(offset, buf),
        }
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        match (&mut self.body, self.kind) {
            (Body::Pages(pages), _) => pages.truncate(size),
            (Body::Wal(wal), _) => wal.truncate(size),
            (Body::Bytes(bytes), FileKind::Journal | FileKind::Temp) => bytes.truncate(size),
            (Body::Bytes(_), _) => Err(Error::TruncateInvalid { size }),
        }
    }

    /// The logical file contents as one contiguous byte buffer.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        match &self.body {
            Body::Pages(pages) => pages.snapshot(),
            Body::Wal(wal) => wal.snapshot(),
            Body::Bytes(bytes) => {
                let mut data = Vec::new();
                data.try_reserve_exact(bytes.0.len())
                    .map_err(|_| Error::<BackendError>::NoMem)?;
                data.extend_from_slice(&bytes.0);
                Ok(data)
            }
        }
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.body {
            Body::Pages(pages) => {
                pages.restore(data)?;
                // Snapshots only ever originate from WAL-mode databases, so
                // the restored content is immediately writable again.
                self.wal_mode = true;
                self.sync_off = true;
                Ok(())
            }
            Body::Wal(wal) => wal.restore(data),
            Body::Bytes(bytes) => {
                bytes.0.clear();
                bytes.write(0, data)
            }
        }
    }
}

#[derive(Default)]
pub struct Registry {
    contents: HashMap<String, Content>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<&Content> {
        self.contents.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.contents.contains_key(name)
    }

    /// Resolve or create the named content and take a reference on it.
    /// Returns the kind the new handle dispatches on.
    pub fn open(&mut self, name: &str, opts: &OpenOptions) -> Result<FileKind> {
        if let Some(content) = self.contents.get_mut(name) {
            if opts.access == OpenAccess::CreateNew {
                return Err(Error::AlreadyExists { name: name.into() });
            }
            if opts.delete_on_close {
                content.delete_on_close = true;
            }
            content.refcount += 1;
            return Ok(content.kind);
        }

        if !matches!(opts.access, OpenAccess::Create | OpenAccess::CreateNew) {
            return Err(Error::NotFound { name: name.into() });
        }
        if self.contents.len() >= MAX_CONTENTS {
            return Err(Error::TooManyFiles);
        }

        let kind = FileKind::resolve(opts.kind, name);
        if kind == FileKind::Wal {
            let base = name.strip_suffix("-wal").unwrap_or(name);
            let has_db = self
                .contents
                .get(base)
                .map(|content| content.kind == FileKind::MainDb)
                .unwrap_or(false);
            if !has_db {
                return Err(Error::WalWithoutDb { name: name.into() });
            }
        }

        let mut content = Content::new(kind);
        content.refcount = 1;
        content.delete_on_close = opts.delete_on_close;
        self.contents.insert(name.to_string(), content);
        Ok(kind)
    }

    /// Release one handle's reference; the content disappears when the last
    /// reference goes away and the file was opened delete-on-close.
    pub fn close_handle(&mut self, name: &str, lock: LockKind, shm: &mut ShmHandle) {
        self.set_lock(name, lock, LockKind::None);
        let _ = self.shm_unmap(name, false, shm);

        if let Some(content) = self.contents.get_mut(name) {
            content.refcount = content.refcount.saturating_sub(1);
            if content.refcount == 0 && content.delete_on_close {
                self.contents.remove(name);
            }
        }
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        match self.contents.get(name) {
            None => Err(Error::DeleteNotFound { name: name.into() }),
            Some(content) if content.refcount > 0 => {
                Err(Error::DeleteBusy { name: name.into() })
            }
            Some(_) => {
                self.contents.remove(name);
                Ok(())
            }
        }
    }

    fn require(&self, name: &str) -> Result<&Content> {
        self.contents
            .get(name)
            .ok_or_else(|| Error::NotFound { name: name.into() })
    }

    fn require_mut(&mut self, name: &str) -> Result<&mut Content> {
        self.contents
            .get_mut(name)
            .ok_or_else(|| Error::NotFound { name: name.into() })
    }

    pub fn read(&self, name: &str, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.require(name)?.read(offset, buf)
    }

    pub fn write(&mut self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let kind = self.require(name)?.kind;
        match kind {
            FileKind::MainDb => {
                let content = self.require(name)?;
                if !content.wal_mode {
                    // A database write with a non-empty rollback journal is a
                    // rollback-mode commit; only WAL mode is supported.
                    let journal = format!("{name}-journal");
                    let journal_active = self
                        .contents
                        .get(&journal)
                        .map(|journal| journal.file_size() > 0)
                        .unwrap_or(false);
                    if journal_active {
                        return Err(Error::NotInWalMode);
                    }
                }
                match &mut self.require_mut(name)?.body {
                    Body::Pages(pages) => pages.write(offset, data),
                    _ => unreachable!("main database content is page backed"),
                }
            }
            FileKind::Wal => {
                let base = name.strip_suffix("-wal").unwrap_or(name).to_string();
                let db_page_size = self.contents.get(&base).and_then(Content::page_size);
                match &mut self.require_mut(name)?.body {
                    Body::Wal(wal) => wal.write(offset, data, db_page_size),
                    _ => unreachable!("WAL content is frame backed"),
                }
            }
            _ => match &mut self.require_mut(name)?.body {
                Body::Bytes(bytes) => bytes.write(offset, data),
                _ => unreachable!("journal and temp contents are byte backed"),
            },
        }
    }

    pub fn truncate(&mut self, name: &str, size: u64) -> Result<()> {
        self.require_mut(name)?.truncate(size)
    }

    pub fn file_size(&self, name: &str) -> Result<u64> {
        Ok(self.require(name)?.file_size())
    }

    /// Syncing is free on memory, but it is also the point where rollback
    /// journaling betrays itself: a journal sync (or a database sync before
    /// synchronous-off + WAL mode were negotiated) fails, which keeps every
    /// non-WAL write path out of the database.
    pub fn sync(&self, name: &str) -> Result<()> {
        let content = self.require(name)?;
        match content.kind {
            FileKind::Journal => Err(Error::NotInWalMode),
            FileKind::MainDb if !(content.wal_mode && content.sync_off) => {
                Err(Error::NotInWalMode)
            }
            _ => Ok(()),
        }
    }

    /// Intercepted `PRAGMA` statements on a main database file. The page
    /// size is recorded and immutable once set, only WAL journaling is
    /// accepted, and the synchronous setting feeds the sync gate.
    pub fn pragma(&mut self, name: &str, pragma: &str, value: Option<&str>) -> Result<()> {
        let content = match self.contents.get_mut(name) {
            Some(content) if content.kind == FileKind::MainDb => content,
            _ => return Ok(()),
        };

        match (pragma, value) {
            ("page_size", Some(value)) => {
                if let Ok(size) = value.parse::<u32>() {
                    // Invalid sizes are ignored, like the engine itself does.
                    if format::is_valid_page_size(size) {
                        match &mut content.body {
                            Body::Pages(pages) => pages.apply_page_size(size)?,
                            _ => unreachable!("main database content is page backed"),
                        }
                    }
                }
                Ok(())
            }
            ("journal_mode", Some(value)) => {
                if value.eq_ignore_ascii_case("wal") {
                    content.wal_mode = true;
                    Ok(())
                } else {
                    Err(Error::JournalModeNotWal { mode: value.into() })
                }
            }
            ("synchronous", Some(value)) => {
                content.sync_off = value.eq_ignore_ascii_case("off") || value == "0";
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Record a pager-lock transition of one handle. The pager locks never
    /// block here (all real coordination goes through the shm lock table),
    /// but reserved holders are counted for `xCheckReservedLock`.
    pub fn set_lock(&mut self, name: &str, from: LockKind, to: LockKind) {
        if let Some(content) = self.contents.get_mut(name) {
            let was = from >= LockKind::Reserved;
            let is = to >= LockKind::Reserved;
            if was && !is {
                content.reserved_handles = content.reserved_handles.saturating_sub(1);
            } else if !was && is {
                content.reserved_handles += 1;
            }
        }
    }

    /// Whether a handle other than the calling one holds RESERVED or
    /// stronger.
    pub fn reserved(&self, name: &str, own_lock: LockKind) -> Result<bool> {
        let content = self.require(name)?;
        let own = (own_lock >= LockKind::Reserved) as usize;
        Ok(content.reserved_handles > own)
    }

    pub fn shm_map(
        &mut self,
        name: &str,
        region: u32,
        size: usize,
        extend: bool,
        shm: &mut ShmHandle,
    ) -> Result<Option<NonNull<u8>>> {
        let content = self.require_mut(name)?;
        if content.kind != FileKind::MainDb {
            return Err(BackendError::ShmUnsupported.into());
        }

        let regions = content.shm.get_or_insert_with(Shm::default);
        if !shm.mapped {
            shm.mapped = true;
            regions.add_ref();
        }
        regions.map_region(region, size, extend)
    }

    pub fn shm_lock(
        &mut self,
        name: &str,
        slots: std::ops::Range<u8>,
        mode: ShmLockMode,
        shm: &mut ShmHandle,
    ) -> Result<bool> {
        let content = self.require_mut(name)?;
        let regions = content.shm.as_mut().ok_or(BackendError::ShmNotMapped)?;
        Ok(regions.lock(slots, mode, &mut shm.shared, &mut shm.exclusive))
    }

    pub fn shm_unlock(
        &mut self,
        name: &str,
        slots: std::ops::Range<u8>,
        mode: ShmLockMode,
        shm: &mut ShmHandle,
    ) -> Result<()> {
        let content = self.require_mut(name)?;
        let regions = content.shm.as_mut().ok_or(BackendError::ShmNotMapped)?;
        regions.unlock(slots, mode, &mut shm.shared, &mut shm.exclusive);
        Ok(())
    }

    pub fn shm_unmap(&mut self, name: &str, delete: bool, shm: &mut ShmHandle) -> Result<()> {
        let content = self.require_mut(name)?;
        if let Some(regions) = content.shm.as_mut() {
            if shm.mapped {
                regions.release_all(&mut shm.shared, &mut shm.exclusive);
                let remaining = regions.drop_ref();
                if delete && remaining == 0 {
                    content.shm = None;
                }
            }
        }
        shm.mapped = false;
        Ok(())
    }

    /// Snapshot the named content's logical bytes (`FileRead`).
    pub fn file_read(&self, name: &str) -> Result<Vec<u8>> {
        self.require(name)?.snapshot()
    }

    /// Atomically replace the named content with `data`, creating it first
    /// when it does not exist yet (`FileWrite`).
    pub fn file_write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if !self.contents.contains_key(name) {
            if self.contents.len() >= MAX_CONTENTS {
                return Err(Error::TooManyFiles);
            }
            let kind = FileKind::from_name(name);
            if kind == FileKind::Wal {
                let base = name.strip_suffix("-wal").unwrap_or(name);
                let has_db = self
                    .contents
                    .get(base)
                    .map(|content| content.kind == FileKind::MainDb)
                    .unwrap_or(false);
                if !has_db {
                    return Err(Error::WalWithoutDb { name: name.into() });
                }
            }
            self.contents.insert(name.to_string(), Content::new(kind));
        }

        self.require_mut(name)?.restore(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_opts() -> OpenOptions {
        OpenOptions {
            kind: OpenKind::MainDb,
            access: OpenAccess::Create,
            delete_on_close: false,
        }
    }

    #[test]
    fn exclusive_create_collides() {
        let mut registry = Registry::default();
        registry.open("test.db", &create_opts()).unwrap();

        let opts = OpenOptions {
            access: OpenAccess::CreateNew,
            ..create_opts()
        };
        assert!(matches!(
            registry.open("test.db", &opts),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn open_without_create_requires_existing() {
        let mut registry = Registry::default();
        let opts = OpenOptions {
            access: OpenAccess::Write,
            ..create_opts()
        };
        assert!(matches!(
            registry.open("test.db", &opts),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn content_cap() {
        let mut registry = Registry::default();
        for i in 0..MAX_CONTENTS {
            registry.open(&format!("test-{i}.db"), &create_opts()).unwrap();
        }
        assert!(matches!(
            registry.open("test-64.db", &create_opts()),
            Err(Error::TooManyFiles)
        ));
    }

    #[test]
    fn wal_requires_main_db() {
        let mut registry = Registry::default();
        let opts = OpenOptions {
            kind: OpenKind::Wal,
            ..create_opts()
        };
        assert!(matches!(
            registry.open("test.db-wal", &opts),
            Err(Error::WalWithoutDb { .. })
        ));

        registry.open("test.db", &create_opts()).unwrap();
        registry.open("test.db-wal", &opts).unwrap();
    }

    #[test]
    fn delete_rules() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.delete("test.db"),
            Err(Error::DeleteNotFound { .. })
        ));

        registry.open("test.db", &create_opts()).unwrap();
        assert!(matches!(
            registry.delete("test.db"),
            Err(Error::DeleteBusy { .. })
        ));

        let mut shm = ShmHandle::default();
        registry.close_handle("test.db", LockKind::None, &mut shm);
        registry.delete("test.db").unwrap();
        assert!(!registry.exists("test.db"));
    }

    #[test]
    fn typeless_open_picks_kind_from_suffix() {
        let mut registry = Registry::default();
        let opts = OpenOptions {
            kind: OpenKind::Unspecified,
            ..create_opts()
        };
        registry.open("test.db", &opts).unwrap();
        assert_eq!(registry.get("test.db").unwrap().kind(), FileKind::MainDb);

        registry.open("test.db-journal", &opts).unwrap();
        assert_eq!(
            registry.get("test.db-journal").unwrap().kind(),
            FileKind::Journal
        );
    }

    #[test]
    fn journal_sync_fails_database_sync_gated_on_negotiation() {
        let mut registry = Registry::default();
        registry.open("test.db", &create_opts()).unwrap();
        let journal_opts = OpenOptions {
            kind: OpenKind::MainJournal,
            ..create_opts()
        };
        registry.open("test.db-journal", &journal_opts).unwrap();

        assert!(registry.sync("test.db-journal").is_err());
        assert!(registry.sync("test.db").is_err());

        registry.pragma("test.db", "synchronous", Some("OFF")).unwrap();
        registry
            .pragma("test.db", "journal_mode", Some("WAL"))
            .unwrap();
        assert!(registry.sync("test.db").is_ok());
    }

    #[test]
    fn rollback_commit_writes_are_rejected() {
        let mut registry = Registry::default();
        registry.open("test.db", &create_opts()).unwrap();
        let journal_opts = OpenOptions {
            kind: OpenKind::MainJournal,
            ..create_opts()
        };
        registry.open("test.db-journal", &journal_opts).unwrap();

        // Journal holds data: a rollback commit is in flight.
        registry.write("test.db-journal", 0, &[1; 32]).unwrap();
        let mut page = vec![0; 512];
        page[16..18].copy_from_slice(&512u16.to_be_bytes());
        assert!(matches!(
            registry.write("test.db", 0, &page),
            Err(Error::NotInWalMode)
        ));

        // After negotiating WAL mode the same write is fine.
        registry
            .pragma("test.db", "journal_mode", Some("WAL"))
            .unwrap();
        registry.write("test.db", 0, &page).unwrap();
    }

    #[test]
    fn pragma_page_size_is_sticky() {
        let mut registry = Registry::default();
        registry.open("test.db", &create_opts()).unwrap();

        registry.pragma("test.db", "page_size", Some("512")).unwrap();
        // Invalid values are ignored.
        registry.pragma("test.db", "page_size", Some("4092")).unwrap();
        assert!(registry
            .pragma("test.db", "page_size", Some("1024"))
            .is_err());
        assert!(matches!(
            registry.pragma("test.db", "journal_mode", Some("memory")),
            Err(Error::JournalModeNotWal { .. })
        ));
    }

    #[test]
    fn snapshot_of_missing_content_is_not_found() {
        let registry = Registry::default();
        assert!(matches!(
            registry.file_read("test.db"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn restore_creates_and_round_trips() {
        let mut registry = Registry::default();

        let mut page = vec![7; 512];
        page[16..18].copy_from_slice(&512u16.to_be_bytes());
        registry.file_write("test.db", &page).unwrap();

        let data = registry.file_read("test.db").unwrap();
        assert_eq!(data, page);

        // Restoring a snapshot over itself is a no-op.
        registry.file_write("test.db", &data).unwrap();
        assert_eq!(registry.file_read("test.db").unwrap(), data);

        // The restored database is immediately writable (WAL negotiated).
        registry.write("test.db", 0, &page).unwrap();
    }
}
