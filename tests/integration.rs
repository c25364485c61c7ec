//! End-to-end tests driving the real SQLite engine through a registered
//! in-memory VFS, in WAL mode.

use memlite::MemVfs;
use rusqlite::{Connection, OpenFlags};

/// Register a fresh VFS instance under a test-unique name.
fn vfs(name: &str) -> MemVfs {
    let vfs = MemVfs::new();
    vfs.register(name, false).unwrap();
    vfs
}

fn open(vfs_name: &str, db: &str) -> Connection {
    Connection::open_with_flags_and_vfs(
        db,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        vfs_name,
    )
    .unwrap()
}

/// Negotiate the journaling mode the VFS is specialized for.
fn setup_wal(conn: &Connection, page_size: u32) {
    conn.execute_batch(&format!(
        "PRAGMA page_size={page_size}; PRAGMA synchronous=OFF"
    ))
    .unwrap();
    let mode: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "wal");
}

fn count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn create_insert_and_checkpoint() {
    let vfs = vfs("memlite-it-basic");
    let conn = open("memlite-it-basic", "test.db");
    setup_wal(&conn, 512);

    conn.execute_batch("CREATE TABLE test (n INT)").unwrap();
    let mut insert = conn.prepare("INSERT INTO test (n) VALUES (?1)").unwrap();
    for i in 0..100 {
        insert.execute([i]).unwrap();
    }
    drop(insert);

    assert_eq!(count(&conn), 100);

    // The main database grows in whole pages, the WAL in whole frames.
    let db = vfs.file_read("test.db").unwrap();
    assert!(!db.is_empty());
    assert_eq!(db.len() % 512, 0);
    let wal = vfs.file_read("test.db-wal").unwrap();
    assert_eq!((wal.len() - 32) % (24 + 512), 0);

    // A truncating checkpoint moves everything into the main database.
    let (busy, _log, _ckpt): (i64, i64, i64) = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .unwrap();
    assert_eq!(busy, 0);
    assert_eq!(vfs.file_read("test.db-wal").unwrap().len(), 0);
    assert_eq!(count(&conn), 100);
}

#[test]
fn two_connections_share_one_database() {
    let _vfs = vfs("memlite-it-shared");
    let writer = open("memlite-it-shared", "test.db");
    setup_wal(&writer, 512);
    writer.execute_batch("CREATE TABLE test (n INT)").unwrap();

    let reader = open("memlite-it-shared", "test.db");
    setup_wal(&reader, 512);

    writer
        .execute_batch("INSERT INTO test (n) VALUES (1), (2), (3)")
        .unwrap();
    assert_eq!(count(&reader), 3);

    // A read transaction pins its snapshot while the writer moves on.
    reader.execute_batch("BEGIN").unwrap();
    assert_eq!(count(&reader), 3);
    writer
        .execute_batch("INSERT INTO test (n) VALUES (4)")
        .unwrap();
    assert_eq!(count(&reader), 3);
    reader.execute_batch("COMMIT").unwrap();
    assert_eq!(count(&reader), 4);
}

#[test]
fn checkpoint_blocked_by_reader() {
    let _vfs = vfs("memlite-it-ckpt");
    let writer = open("memlite-it-ckpt", "test.db");
    setup_wal(&writer, 512);
    writer.execute_batch("CREATE TABLE test (n INT)").unwrap();
    for i in 0..50 {
        writer
            .execute(&format!("INSERT INTO test (n) VALUES ({i})"), [])
            .unwrap();
    }

    let reader = open("memlite-it-ckpt", "test.db");
    setup_wal(&reader, 512);
    reader.execute_batch("BEGIN").unwrap();
    // The first read inside the transaction pins the current end of the log.
    assert_eq!(count(&reader), 50);

    // With a reader pinning the log, the truncating checkpoint reports busy.
    let (busy, _log, _ckpt): (i64, i64, i64) = writer
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .unwrap();
    assert_eq!(busy, 1);

    reader.execute_batch("COMMIT").unwrap();

    let (busy, _log, _ckpt): (i64, i64, i64) = writer
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .unwrap();
    assert_eq!(busy, 0);
}

#[test]
fn journal_mode_other_than_wal_is_rejected() {
    let _vfs = vfs("memlite-it-mode");
    let conn = open("memlite-it-mode", "test.db");
    conn.execute_batch("PRAGMA synchronous=OFF").unwrap();

    let result = conn.query_row("PRAGMA journal_mode=MEMORY", [], |row| {
        row.get::<_, String>(0)
    });
    assert!(result.is_err());
}

#[test]
fn wal_mode_requires_synchronous_off() {
    let _vfs = vfs("memlite-it-sync");
    let conn = open("memlite-it-sync", "test.db");

    // Without synchronous=OFF the rollback-journal commit that flips the
    // version bytes hits a failing sync.
    let result = conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
        row.get::<_, String>(0)
    });
    assert!(result.is_err());
}

#[test]
fn default_page_size_without_pragma() {
    let vfs = vfs("memlite-it-nops");
    let conn = open("memlite-it-nops", "test.db");
    conn.execute_batch("PRAGMA synchronous=OFF").unwrap();
    let mode: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "wal");

    conn.execute_batch("CREATE TABLE foo (n INT)").unwrap();
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)").ok();

    // The engine used its default 4096-byte pages; the VFS derived that from
    // the first page it saw.
    let db = vfs.file_read("test.db").unwrap();
    assert_eq!(db.len() % 4096, 0);
    assert!(!db.is_empty());
}

#[test]
fn snapshot_and_restore_through_the_engine() {
    let vfs = vfs("memlite-it-snap");
    let conn = open("memlite-it-snap", "test.db");
    setup_wal(&conn, 512);
    conn.execute_batch("CREATE TABLE test (n INT)").unwrap();
    for i in 0..25 {
        conn.execute(&format!("INSERT INTO test (n) VALUES ({i})"), [])
            .unwrap();
    }

    let db = vfs.file_read("test.db").unwrap();
    let wal = vfs.file_read("test.db-wal").unwrap();
    drop(conn);

    // Ship the snapshot to a different database name, as the consensus layer
    // does when installing state on a follower.
    vfs.file_write("restored.db", &db).unwrap();
    vfs.file_write("restored.db-wal", &wal).unwrap();

    let restored = open("memlite-it-snap", "restored.db");
    let rows: i64 = restored
        .query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 25);
}

#[test]
fn reopen_after_close_keeps_data() {
    let _vfs = vfs("memlite-it-reopen");
    {
        let conn = open("memlite-it-reopen", "test.db");
        setup_wal(&conn, 512);
        conn.execute_batch("CREATE TABLE test (n INT); INSERT INTO test VALUES (7)")
            .unwrap();
    }

    let conn = open("memlite-it-reopen", "test.db");
    assert_eq!(count(&conn), 1);
}
