//! Facade-level tests driving the VFS through its trait surface, covering
//! the open protocol, the binary layout rules, the shared-memory lock table
//! and the snapshot primitives.

use memlite::MemVfs;
use sqlite_vfs::error::{errno, Error};
use sqlite_vfs::{DatabaseHandle, OpenAccess, OpenKind, OpenOptions, ShmLockMode, Vfs};

fn opts(kind: OpenKind, access: OpenAccess) -> OpenOptions {
    OpenOptions {
        kind,
        access,
        delete_on_close: false,
    }
}

fn create_db() -> OpenOptions {
    opts(OpenKind::MainDb, OpenAccess::Create)
}

/// A 100-byte database header with the given page size.
fn db_header(page_size: u16) -> Vec<u8> {
    let mut header = vec![0; 100];
    header[16..18].copy_from_slice(&page_size.to_be_bytes());
    header
}

/// A full first page (header included) with the given page size.
fn db_page(page_size: usize, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; page_size];
    page[16..18].copy_from_slice(&(page_size as u16).to_be_bytes());
    page
}

/// A 32-byte WAL header with the given page size.
fn wal_header(page_size: u32) -> Vec<u8> {
    let mut header = vec![0; 32];
    header[8..12].copy_from_slice(&page_size.to_be_bytes());
    header
}

#[test]
fn exclusive_open_collision() {
    let vfs = MemVfs::new();
    vfs.open("test.db", create_db()).unwrap();

    let err = vfs
        .open("test.db", opts(OpenKind::MainDb, OpenAccess::CreateNew))
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert_eq!(err.os_errno(), Some(errno::EEXIST));
    assert_eq!(err.primary_code(), Some(rusqlite::ffi::SQLITE_CANTOPEN));
}

#[test]
fn reopen_does_not_need_create() {
    let vfs = MemVfs::new();
    let file = vfs.open("test.db", create_db()).unwrap();
    drop(file);

    vfs.open("test.db", opts(OpenKind::MainDb, OpenAccess::Write))
        .unwrap();
}

#[test]
fn open_missing_without_create() {
    let vfs = MemVfs::new();
    let err = vfs
        .open("test.db", opts(OpenKind::MainDb, OpenAccess::Read))
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(err.os_errno(), Some(errno::ENOENT));
}

#[test]
fn file_limit() {
    let vfs = MemVfs::new();
    let mut files = Vec::new();
    for i in 0..64 {
        files.push(vfs.open(&format!("test-{i}.db"), create_db()).unwrap());
    }

    let err = vfs.open("test-64.db", create_db()).unwrap_err();
    assert!(matches!(err, Error::TooManyFiles));
    assert_eq!(err.os_errno(), Some(errno::ENFILE));
}

#[test]
fn wal_before_db_is_corrupt() {
    let vfs = MemVfs::new();
    let err = vfs
        .open("test.db-wal", opts(OpenKind::Wal, OpenAccess::Create))
        .unwrap_err();
    assert!(matches!(err, Error::WalWithoutDb { .. }));
    assert_eq!(err.primary_code(), Some(rusqlite::ffi::SQLITE_CORRUPT));
}

#[test]
fn page_size_derivation() {
    let vfs = MemVfs::new();
    let mut file = vfs.open("test.db", create_db()).unwrap();

    file.write_all_at(&db_header(512), 0).unwrap();
    assert_eq!(file.size().unwrap(), 0);

    file.write_all_at(&db_page(512, 0), 0).unwrap();
    assert_eq!(file.size().unwrap(), 512);
}

#[test]
fn read_never_written_is_short_and_zeroed() {
    let vfs = MemVfs::new();
    let mut file = vfs.open("test.db", create_db()).unwrap();

    let mut buf = [123u8; 1];
    let err = file.read_exact_at(&mut buf, 0).unwrap_err();
    assert!(matches!(err, Error::ShortRead));
    assert_eq!(buf[0], 0);
}

#[test]
fn write_and_read_pages() {
    let vfs = MemVfs::new();
    let mut file = vfs.open("test.db", create_db()).unwrap();

    file.write_all_at(&db_header(512), 0).unwrap();

    let mut page_1 = db_page(512, 0);
    page_1[101] = 1;
    page_1[256] = 2;
    page_1[511] = 3;
    file.write_all_at(&page_1, 0).unwrap();

    let mut page_2 = vec![0u8; 512];
    page_2[0] = 4;
    page_2[256] = 5;
    page_2[511] = 6;
    file.write_all_at(&page_2, 512).unwrap();

    let mut buf = vec![0u8; 512];
    file.read_exact_at(&mut buf, 0).unwrap();
    assert_eq!(buf, page_1);
    file.read_exact_at(&mut buf, 512).unwrap();
    assert_eq!(buf, page_2);
}

#[test]
fn out_of_order_page_writes_fail() {
    let vfs = MemVfs::new();
    let mut file = vfs.open("test.db", create_db()).unwrap();

    // Second page before the first.
    assert!(matches!(
        file.write_all_at(&db_page(512, 0), 512),
        Err(Error::WriteOutOfOrder { .. })
    ));

    file.write_all_at(&db_page(512, 0), 0).unwrap();

    // Third page before the second.
    assert!(matches!(
        file.write_all_at(&db_page(512, 0), 1024),
        Err(Error::WriteOutOfOrder { .. })
    ));
}

#[test]
fn wal_frame_layout() {
    let vfs = MemVfs::new();
    let mut db = vfs.open("test.db", create_db()).unwrap();
    db.write_all_at(&db_header(512), 0).unwrap();

    let mut wal = vfs
        .open("test.db-wal", opts(OpenKind::Wal, OpenAccess::Create))
        .unwrap();
    assert_eq!(wal.size().unwrap(), 0);

    wal.write_all_at(&wal_header(512), 0).unwrap();
    wal.write_all_at(&[1; 24], 32).unwrap();
    let payload_1 = vec![2u8; 512];
    wal.write_all_at(&payload_1, 32 + 24).unwrap();
    wal.write_all_at(&[3; 24], 568).unwrap();
    let payload_2 = vec![4u8; 512];
    wal.write_all_at(&payload_2, 592).unwrap();

    assert_eq!(wal.size().unwrap(), 1104);

    let mut buf = vec![0u8; 512];
    wal.read_exact_at(&mut buf, 32 + 24).unwrap();
    assert_eq!(buf, payload_1);

    let mut buf = [0u8; 24];
    wal.read_exact_at(&mut buf, 568).unwrap();
    assert_eq!(buf, [3; 24]);
}

#[test]
fn truncate_alignment() {
    let vfs = MemVfs::new();
    let mut file = vfs.open("test.db", create_db()).unwrap();

    // Truncating an empty file is a no-op, growing it is not possible.
    file.set_len(0).unwrap();
    assert!(matches!(
        file.set_len(512),
        Err(Error::TruncateInvalid { .. })
    ));

    file.write_all_at(&db_page(512, 0), 0).unwrap();
    file.write_all_at(&vec![0u8; 512], 512).unwrap();
    assert_eq!(file.size().unwrap(), 1024);

    file.set_len(512).unwrap();
    assert_eq!(file.size().unwrap(), 512);

    assert!(matches!(
        file.set_len(400),
        Err(Error::TruncateInvalid { .. })
    ));

    file.set_len(0).unwrap();
    assert_eq!(file.size().unwrap(), 0);
}

#[test]
fn wal_truncates_only_to_zero() {
    let vfs = MemVfs::new();
    let mut db = vfs.open("test.db", create_db()).unwrap();
    db.write_all_at(&db_header(512), 0).unwrap();

    let mut wal = vfs
        .open("test.db-wal", opts(OpenKind::Wal, OpenAccess::Create))
        .unwrap();
    wal.write_all_at(&wal_header(512), 0).unwrap();
    wal.write_all_at(&[1; 24], 32).unwrap();
    wal.write_all_at(&vec![2u8; 512], 56).unwrap();

    assert!(matches!(
        wal.set_len(32),
        Err(Error::TruncateInvalid { .. })
    ));
    wal.set_len(0).unwrap();
    assert_eq!(wal.size().unwrap(), 0);
}

#[test]
fn journal_files_are_byte_granular() {
    let vfs = MemVfs::new();
    let mut journal = vfs
        .open(
            "test.db-journal",
            opts(OpenKind::MainJournal, OpenAccess::Create),
        )
        .unwrap();

    journal.write_all_at(b"hello", 3).unwrap();
    assert_eq!(journal.size().unwrap(), 8);

    let mut buf = [0u8; 8];
    journal.read_exact_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"\0\0\0hello");

    // Journals truncate to any size.
    journal.set_len(5).unwrap();
    assert_eq!(journal.size().unwrap(), 5);
    journal.set_len(0).unwrap();
}

#[test]
fn temp_files_round_trip() {
    let vfs = MemVfs::new();
    let name = vfs.temporary_name();
    let mut file = vfs
        .open(
            &name,
            OpenOptions {
                kind: OpenKind::TempJournal,
                access: OpenAccess::Create,
                delete_on_close: true,
            },
        )
        .unwrap();

    file.write_all_at(b"hello", 0).unwrap();
    let mut buf = [0u8; 5];
    file.read_exact_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"hello");

    drop(file);
    // Deleted on close.
    assert!(!vfs.exists(&name).unwrap());
}

#[test]
fn delete_rules() {
    let vfs = MemVfs::new();

    let err = vfs.delete("test.db").unwrap_err();
    assert!(matches!(err, Error::DeleteNotFound { .. }));
    assert_eq!(err.os_errno(), Some(errno::ENOENT));

    let file = vfs.open("test.db", create_db()).unwrap();
    let err = vfs.delete("test.db").unwrap_err();
    assert!(matches!(err, Error::DeleteBusy { .. }));
    assert_eq!(err.os_errno(), Some(errno::EBUSY));

    drop(file);
    vfs.delete("test.db").unwrap();

    // Reopening without CREATE now fails again.
    assert!(matches!(
        vfs.open("test.db", opts(OpenKind::MainDb, OpenAccess::Write)),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn access_reports_existence() {
    let vfs = MemVfs::new();
    assert!(!vfs.exists("test.db").unwrap());

    let file = vfs.open("test.db", create_db()).unwrap();
    assert!(vfs.exists("test.db").unwrap());
    drop(file);

    // Closing alone does not delete.
    assert!(vfs.exists("test.db").unwrap());
}

#[test]
fn full_pathname_is_identity() {
    let vfs = MemVfs::new();
    assert_eq!(vfs.full_pathname("test.db").unwrap(), "test.db");
}

#[test]
fn shm_lock_conflicts() {
    let vfs = MemVfs::new();
    let mut a = vfs.open("test.db", create_db()).unwrap();
    let mut b = vfs
        .open("test.db", opts(OpenKind::MainDb, OpenAccess::Write))
        .unwrap();

    a.shm_map(0, 32768, true).unwrap().unwrap();
    b.shm_map(0, 32768, true).unwrap().unwrap();

    // Exclusive [2..5) blocks a shared acquisition of slot 3.
    assert!(a.shm_lock(2..5, ShmLockMode::Exclusive).unwrap());
    assert!(!b.shm_lock(3..4, ShmLockMode::Shared).unwrap());

    a.shm_unlock(2..5, ShmLockMode::Exclusive).unwrap();
    assert!(b.shm_lock(3..4, ShmLockMode::Shared).unwrap());

    // And a shared holder now blocks the exclusive range.
    assert!(!a.shm_lock(2..5, ShmLockMode::Exclusive).unwrap());
}

#[test]
fn shm_unlock_without_lock_is_ok() {
    let vfs = MemVfs::new();
    let mut file = vfs.open("test.db", create_db()).unwrap();
    file.shm_map(0, 32768, true).unwrap().unwrap();

    file.shm_unlock(3..4, ShmLockMode::Shared).unwrap();
    file.shm_unlock(2..3, ShmLockMode::Shared).unwrap();
    file.shm_unmap(true).unwrap();
}

#[test]
fn shm_regions_are_shared_between_handles() {
    let vfs = MemVfs::new();
    let mut a = vfs.open("test.db", create_db()).unwrap();
    let mut b = vfs
        .open("test.db", opts(OpenKind::MainDb, OpenAccess::Write))
        .unwrap();

    let region_a = a.shm_map(0, 32768, true).unwrap().unwrap();
    let region_b = b.shm_map(0, 32768, true).unwrap().unwrap();
    assert_eq!(region_a, region_b);

    unsafe {
        *region_a.as_ptr() = 42;
        assert_eq!(*region_b.as_ptr(), 42);
    }

    // Without the extend flag, a missing region is reported as absent.
    assert!(a.shm_map(5, 32768, false).unwrap().is_none());
}

#[test]
fn shm_locks_released_on_close() {
    let vfs = MemVfs::new();
    let mut a = vfs.open("test.db", create_db()).unwrap();
    let mut b = vfs
        .open("test.db", opts(OpenKind::MainDb, OpenAccess::Write))
        .unwrap();

    a.shm_map(0, 32768, true).unwrap().unwrap();
    b.shm_map(0, 32768, true).unwrap().unwrap();
    assert!(a.shm_lock(0..8, ShmLockMode::Exclusive).unwrap());
    drop(a);

    assert!(b.shm_lock(0..8, ShmLockMode::Shared).unwrap());
}

#[test]
fn snapshot_round_trip() {
    let vfs = MemVfs::new();
    let mut db = vfs.open("test.db", create_db()).unwrap();
    db.write_all_at(&db_page(512, 1), 0).unwrap();
    db.write_all_at(&vec![2u8; 512], 512).unwrap();

    let mut wal = vfs
        .open("test.db-wal", opts(OpenKind::Wal, OpenAccess::Create))
        .unwrap();
    wal.write_all_at(&wal_header(512), 0).unwrap();
    wal.write_all_at(&[1; 24], 32).unwrap();
    wal.write_all_at(&vec![3u8; 512], 56).unwrap();

    let db_bytes = vfs.file_read("test.db").unwrap();
    assert_eq!(db_bytes.len(), 1024);
    let wal_bytes = vfs.file_read("test.db-wal").unwrap();
    assert_eq!(wal_bytes.len(), 568);

    // Restoring a snapshot over itself is a no-op.
    vfs.file_write("test.db", &db_bytes).unwrap();
    vfs.file_write("test.db-wal", &wal_bytes).unwrap();
    assert_eq!(vfs.file_read("test.db").unwrap(), db_bytes);
    assert_eq!(vfs.file_read("test.db-wal").unwrap(), wal_bytes);

    // And restoring into a fresh pair of files reproduces them exactly.
    vfs.file_write("copy.db", &db_bytes).unwrap();
    vfs.file_write("copy.db-wal", &wal_bytes).unwrap();
    assert_eq!(vfs.file_read("copy.db").unwrap(), db_bytes);
    assert_eq!(vfs.file_read("copy.db-wal").unwrap(), wal_bytes);
}

#[test]
fn snapshot_of_empty_file_is_empty() {
    let vfs = MemVfs::new();
    let _file = vfs.open("test.db", create_db()).unwrap();
    assert_eq!(vfs.file_read("test.db").unwrap(), Vec::<u8>::new());
}

#[test]
fn snapshot_of_missing_file_is_cant_open() {
    let vfs = MemVfs::new();
    let err = vfs.file_read("test.db").unwrap_err();
    assert_eq!(err.primary_code(), Some(rusqlite::ffi::SQLITE_CANTOPEN));
}

#[test]
fn restore_rejects_partial_pages() {
    let vfs = MemVfs::new();
    let mut data = db_page(512, 1);
    data.extend_from_slice(&[0; 100]);
    assert!(vfs.file_write("test.db", &data).is_err());
}
