use rusqlite::{params, Connection, OptionalExtension};

/// How far a tailed file has been ingested.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReadOffset {
    pub byte_offset: u64,
    /// Device and inode on Unix, used to notice rotation.
    pub file_identity: Option<String>,
}

pub fn load_offset(conn: &Connection, path: &str) -> rusqlite::Result<Option<ReadOffset>> {
    conn.prepare_cached("SELECT byte_offset, file_identity FROM ingest_offsets WHERE path = ?")?
        .query_row(params![path], |row| {
            let byte_offset: i64 = row.get(0)?;
            Ok(ReadOffset {
                byte_offset: u64::try_from(byte_offset).unwrap_or(0),
                file_identity: row.get(1)?,
            })
        })
        .optional()
}

pub fn save_offset(conn: &Connection, path: &str, offset: &ReadOffset) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "
        INSERT INTO
        ingest_offsets(path, byte_offset, file_identity)
        VALUES(?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            byte_offset = excluded.byte_offset,
            file_identity = excluded.file_identity,
            updated_at = CURRENT_TIMESTAMP
        ",
    )?
    .execute(params![
        path,
        i64::try_from(offset.byte_offset).unwrap_or(i64::MAX),
        offset.file_identity
    ])?;
    Ok(())
}
