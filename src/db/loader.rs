use super::cache::UserAgentCache;
use super::types::UserAgentId;
use crate::error::StorageError;
use crate::models::LogRecord;
use crate::useragent::normalize;
use itertools::Itertools;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::HashSet;
use tracing::{debug, error, info};

// Stays well under SQLITE_MAX_VARIABLE_NUMBER on old builds.
const DIGEST_LOOKUP_CHUNK: usize = 500;

const SELECT_USERAGENT: &str = "SELECT id FROM user_agents WHERE raw = ?";

const INSERT_USERAGENT: &str = "
    INSERT INTO
    user_agents(raw, os, browser, device_type)
    VALUES(?, ?, ?, ?)
    ON CONFLICT(raw) DO UPDATE SET raw = excluded.raw RETURNING id
";

const INSERT_RECORD: &str = "
    INSERT INTO
    log_records(digest, client_address, timestamp, utc_offset_seconds, method, path,
                protocol, status_code, bytes_sent, referrer, user_agent_id)
    VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(digest) DO NOTHING
";

/// What one committed batch did.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct LoadOutcome {
    pub inserted: u64,
    pub duplicates: u64,
    pub identities_created: u64,
}

/// Writes batches of parsed records, one transaction per batch.
///
/// The loader owns the identity cache for its run; dropping the loader drops
/// the cache.
pub struct BatchLoader<'conn> {
    conn: &'conn mut Connection,
    cache: UserAgentCache,
    batches_committed: u64,
}

impl<'conn> BatchLoader<'conn> {
    pub fn new(conn: &'conn mut Connection) -> BatchLoader<'conn> {
        BatchLoader {
            conn,
            cache: UserAgentCache::new(),
            batches_committed: 0,
        }
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches_committed
    }

    pub fn cache(&self) -> &UserAgentCache {
        &self.cache
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Persists one batch atomically. On error nothing from this batch is
    /// durable, previously committed batches are untouched.
    pub fn load(&mut self, batch: &[LogRecord]) -> Result<LoadOutcome, StorageError> {
        if batch.is_empty() {
            return Ok(LoadOutcome::default());
        }

        let tx = self.conn.transaction()?;
        let result = write_batch(&tx, &mut self.cache, batch).and_then(|outcome| {
            tx.commit()?;
            Ok(outcome)
        });

        match result {
            Ok(outcome) => {
                self.cache.commit();
                self.batches_committed += 1;
                info!(
                    batch = self.batches_committed,
                    records = batch.len(),
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    identities_created = outcome.identities_created,
                    "committed batch"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.cache.rollback();
                error!(
                    batch = self.batches_committed + 1,
                    records = batch.len(),
                    error = %err,
                    "batch rolled back"
                );
                Err(err)
            }
        }
    }
}

fn write_batch(
    tx: &Transaction,
    cache: &mut UserAgentCache,
    batch: &[LogRecord],
) -> Result<LoadOutcome, StorageError> {
    let existing = existing_digests(tx, batch)?;
    let mut seen: HashSet<&str> = HashSet::with_capacity(batch.len());
    let mut outcome = LoadOutcome::default();
    let mut insert = tx.prepare_cached(INSERT_RECORD)?;

    for record in batch {
        let digest = record.digest.as_str();
        if existing.contains(digest) || !seen.insert(digest) {
            outcome.duplicates += 1;
            continue;
        }

        let useragent_id = match record.useragent.as_deref() {
            Some(raw) => {
                let (id, created) = resolve_useragent(tx, cache, raw)?;
                if created {
                    outcome.identities_created += 1;
                }
                Some(id)
            }
            None => None,
        };

        let bytes_sent = i64::try_from(record.bytes_sent)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let changed = insert.execute(params![
            record.digest,
            record.client_address,
            record.timestamp.to_storage(),
            record.timestamp.utc_offset_seconds(),
            record.method,
            record.path,
            record.protocol,
            record.status_code,
            bytes_sent,
            record.referrer,
            useragent_id,
        ])?;

        // Zero rows means another writer committed the digest since the lookup.
        if changed == 0 {
            outcome.duplicates += 1;
        } else {
            outcome.inserted += 1;
        }
    }

    Ok(outcome)
}

fn existing_digests(conn: &Connection, batch: &[LogRecord]) -> rusqlite::Result<HashSet<String>> {
    let digests = batch
        .iter()
        .map(|record| record.digest.as_str())
        .unique()
        .collect::<Vec<_>>();

    let mut existing = HashSet::new();
    for chunk in digests.chunks(DIGEST_LOOKUP_CHUNK) {
        let sql = format!(
            "SELECT digest FROM log_records WHERE digest IN ({})",
            std::iter::repeat("?").take(chunk.len()).join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
        for digest in rows {
            existing.insert(digest?);
        }
    }
    debug!(
        candidates = digests.len(),
        existing = existing.len(),
        "checked digests"
    );
    Ok(existing)
}

/// Returns the identity id for `raw` and whether this call created it.
fn resolve_useragent(
    conn: &Connection,
    cache: &mut UserAgentCache,
    raw: &str,
) -> rusqlite::Result<(UserAgentId, bool)> {
    if let Some(id) = cache.get(raw) {
        return Ok((id, false));
    }

    let existing: Option<UserAgentId> = conn
        .prepare_cached(SELECT_USERAGENT)?
        .query_row(params![raw], |row| row.get(0))
        .optional()?;

    let (id, created) = match existing {
        Some(id) => (id, false),
        None => {
            let identity = normalize(raw);
            let id: UserAgentId = conn.prepare_cached(INSERT_USERAGENT)?.query_row(
                params![
                    identity.raw,
                    identity.os,
                    identity.browser,
                    identity.device_type.as_str()
                ],
                |row| row.get(0),
            )?;
            (id, true)
        }
    };

    cache.stage(raw, id);
    Ok((id, created))
}
