//! Demo: run SQLite in WAL mode on the in-memory VFS, then snapshot the
//! database and restore it under a different name.

use memlite::MemVfs;
use rusqlite::{Connection, OpenFlags};

fn open(vfs: &str, name: &str) -> Result<Connection, rusqlite::Error> {
    Connection::open_with_flags_and_vfs(
        name,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        vfs,
    )
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let vfs = MemVfs::new();
    vfs.register("memlite", false)?;

    let conn = open("memlite", "demo.db")?;
    conn.execute_batch("PRAGMA page_size=4096; PRAGMA synchronous=OFF")?;
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    assert_eq!(mode, "wal");

    conn.execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)")?;
    let mut insert = conn.prepare("INSERT INTO kv (k, v) VALUES (?1, ?2)")?;
    for i in 0..100 {
        insert.execute((format!("key-{i}"), format!("value-{i}")))?;
    }
    drop(insert);

    let db = vfs.file_read("demo.db")?;
    let wal = vfs.file_read("demo.db-wal")?;
    tracing::info!(db = db.len(), wal = wal.len(), "snapshot taken");

    vfs.file_write("copy.db", &db)?;
    vfs.file_write("copy.db-wal", &wal)?;

    let copy = open("memlite", "copy.db")?;
    let rows: i64 = copy.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
    tracing::info!(rows, "restored snapshot");
    assert_eq!(rows, 100);

    println!("restored {rows} rows from an in-memory snapshot");
    Ok(())
}
