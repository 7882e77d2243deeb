pub mod cache;
pub mod loader;
pub mod offsets;
pub mod reports;
pub mod types;

use crate::error::StorageError;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = include_str!("db/schema.sql");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

/// Opens (creating if needed) the database file and bootstraps the schema.
pub fn init(path: impl AsRef<Path>) -> Result<DbPool, StorageError> {
    let manager = SqliteConnectionManager::file(path.as_ref())
        .with_init(|c| configure(c));
    let pool = r2d2::Pool::builder().max_size(4).build(manager)?;
    let conn = pool.get()?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
    create_schema(&conn)?;
    Ok(pool)
}

pub fn open_in_memory() -> Result<Connection, StorageError> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    create_schema(&conn)?;
    Ok(conn)
}
