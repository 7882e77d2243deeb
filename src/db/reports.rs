//! Read-only aggregate queries over the stored records, plus the explicit
//! retention cleanup.

use super::types::RecordId;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

const STORED_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CountRow {
    pub key: String,
    pub count: i64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct StatusShare {
    pub status_code: u16,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HourlyCount {
    pub hour: u32,
    pub count: i64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ErrorRecord {
    pub id: RecordId,
    pub client_address: String,
    pub timestamp: NaiveDateTime,
    pub path: String,
    pub status_code: u16,
    pub useragent: String,
}

#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct StoreStats {
    pub total_records: i64,
    pub total_user_agents: i64,
    pub unique_addresses: i64,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let text: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&text, STORED_TIMESTAMP)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<NaiveDateTime>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        NaiveDateTime::parse_from_str(&t, STORED_TIMESTAMP)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn count_rows(conn: &Connection, sql: &str, n: u32) -> rusqlite::Result<Vec<CountRow>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![n], |row| {
        Ok(CountRow {
            key: row.get(0)?,
            count: row.get(1)?,
        })
    })?;
    rows.collect()
}

/// Most frequent client addresses.
pub fn top_addresses(conn: &Connection, n: u32) -> rusqlite::Result<Vec<CountRow>> {
    count_rows(
        conn,
        "
        SELECT client_address, COUNT(*) AS request_count
        FROM log_records
        GROUP BY client_address
        ORDER BY request_count DESC, client_address ASC
        LIMIT ?
        ",
        n,
    )
}

/// Most requested paths.
pub fn top_paths(conn: &Connection, n: u32) -> rusqlite::Result<Vec<CountRow>> {
    count_rows(
        conn,
        "
        SELECT path, COUNT(*) AS request_count
        FROM log_records
        GROUP BY path
        ORDER BY request_count DESC, path ASC
        LIMIT ?
        ",
        n,
    )
}

pub fn status_distribution(conn: &Connection) -> rusqlite::Result<Vec<StatusShare>> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT
            status_code,
            COUNT(*) AS request_count,
            ROUND(COUNT(*) * 100.0 / (SELECT COUNT(*) FROM log_records), 2) AS percentage
        FROM log_records
        GROUP BY status_code
        ORDER BY request_count DESC, status_code ASC
        ",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(StatusShare {
            status_code: row.get(0)?,
            count: row.get(1)?,
            percentage: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Requests per hour of day, from the wall-clock time written in the log.
pub fn hourly_traffic(conn: &Connection) -> rusqlite::Result<Vec<HourlyCount>> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT CAST(strftime('%H', timestamp) AS INTEGER) AS hour_of_day, COUNT(*)
        FROM log_records
        GROUP BY hour_of_day
        ORDER BY hour_of_day ASC
        ",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(HourlyCount {
            hour: row.get(0)?,
            count: row.get(1)?,
        })
    })?;
    rows.collect()
}

/// Requests per operating system. Records without a user agent count as Unknown.
pub fn traffic_by_os(conn: &Connection) -> rusqlite::Result<Vec<CountRow>> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT COALESCE(ua.os, 'Unknown') AS os_name, COUNT(r.id) AS request_count
        FROM log_records r
        LEFT JOIN user_agents ua ON r.user_agent_id = ua.id
        GROUP BY os_name
        ORDER BY request_count DESC, os_name ASC
        ",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CountRow {
            key: row.get(0)?,
            count: row.get(1)?,
        })
    })?;
    rows.collect()
}

/// 4xx and 5xx records on one calendar date, oldest first.
pub fn error_records_on(conn: &Connection, date: NaiveDate) -> rusqlite::Result<Vec<ErrorRecord>> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT
            r.id,
            r.client_address,
            r.timestamp,
            r.path,
            r.status_code,
            COALESCE(ua.raw, 'Unknown')
        FROM log_records r
        LEFT JOIN user_agents ua ON r.user_agent_id = ua.id
        WHERE date(r.timestamp) = ? AND r.status_code >= 400
        ORDER BY r.timestamp ASC, r.id ASC
        ",
    )?;
    let rows = stmt.query_map(params![date.format("%Y-%m-%d").to_string()], |row| {
        Ok(ErrorRecord {
            id: row.get(0)?,
            client_address: row.get(1)?,
            timestamp: timestamp_column(row, 2)?,
            path: row.get(3)?,
            status_code: row.get(4)?,
            useragent: row.get(5)?,
        })
    })?;
    rows.collect()
}

pub fn store_stats(conn: &Connection) -> rusqlite::Result<StoreStats> {
    let mut stats = conn.query_row(
        "
        SELECT COUNT(*), COUNT(DISTINCT client_address), MIN(timestamp), MAX(timestamp)
        FROM log_records
        ",
        [],
        |row| {
            Ok(StoreStats {
                total_records: row.get(0)?,
                unique_addresses: row.get(1)?,
                earliest: optional_timestamp_column(row, 2)?,
                latest: optional_timestamp_column(row, 3)?,
                total_user_agents: 0,
            })
        },
    )?;
    stats.total_user_agents =
        conn.query_row("SELECT COUNT(*) FROM user_agents", [], |row| row.get(0))?;
    Ok(stats)
}

/// Deletes records older than `cutoff`, then identities nothing refers to.
/// Returns the number of deleted records.
pub fn cleanup_before(conn: &mut Connection, cutoff: NaiveDateTime) -> rusqlite::Result<u64> {
    let tx = conn.transaction()?;
    let deleted = tx.execute(
        "DELETE FROM log_records WHERE timestamp < ?",
        params![cutoff.format(STORED_TIMESTAMP).to_string()],
    )?;
    tx.execute(
        "
        DELETE FROM user_agents
        WHERE id NOT IN (
            SELECT user_agent_id FROM log_records WHERE user_agent_id IS NOT NULL
        )
        ",
        [],
    )?;
    tx.commit()?;
    Ok(deleted as u64)
}
