use crate::config::TailConfig;
use crate::db::offsets::{load_offset, save_offset, ReadOffset};
use crate::error::{StorageError, TailError};
use crate::models::BatchResult;
use crate::pipeline::{IngestOptions, Ingestor};
use crate::utils::StopSignal;
use rusqlite::Connection;
use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PollOutcome {
    /// The file does not exist (yet).
    Missing,
    /// No complete line past the stored offset.
    Unchanged { offset: u64 },
    Ingested {
        result: BatchResult,
        offset: u64,
        /// More bytes are waiting past the chunk just read.
        pending: bool,
    },
}

/// Follows one growing log file, feeding newly appended lines through the
/// ingestion pipeline. The read offset is stored next to the records so a
/// restart continues where the last committed poll stopped.
pub struct Tailer<'conn> {
    conn: &'conn mut Connection,
    path: PathBuf,
    key: String,
    options: IngestOptions,
    config: TailConfig,
}

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(format!("{}:{}", metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> Option<String> {
    None
}

impl<'conn> Tailer<'conn> {
    pub fn new(
        conn: &'conn mut Connection,
        path: impl AsRef<Path>,
        options: IngestOptions,
        config: TailConfig,
    ) -> Tailer<'conn> {
        let path = path.as_ref().to_path_buf();
        Tailer {
            conn,
            key: path.to_string_lossy().into_owned(),
            path,
            options,
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> TailError {
        TailError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn store(&self, offset: &ReadOffset) -> Result<(), TailError> {
        save_offset(self.conn, &self.key, offset).map_err(StorageError::from)?;
        Ok(())
    }

    /// Where reading resumes, after checking the stored offset against the
    /// file as it is now.
    fn resume_offset(&self, size: u64, identity: &Option<String>) -> Result<u64, TailError> {
        let stored = load_offset(self.conn, &self.key).map_err(StorageError::from)?;
        let start = match stored {
            None if self.config.from_start => 0,
            None => {
                info!(path = %self.path.display(), offset = size, "starting at end of file");
                size
            }
            Some(stored) => {
                let rotated = match (&stored.file_identity, identity) {
                    (Some(before), Some(now)) => before != now,
                    _ => false,
                };
                if rotated {
                    warn!(path = %self.path.display(), "file was rotated, reading from the start");
                    0
                } else if stored.byte_offset > size {
                    warn!(
                        path = %self.path.display(),
                        offset = stored.byte_offset,
                        size,
                        "file was truncated, reading from the start"
                    );
                    0
                } else {
                    return Ok(stored.byte_offset);
                }
            }
        };
        self.store(&ReadOffset {
            byte_offset: start,
            file_identity: identity.clone(),
        })?;
        Ok(start)
    }

    /// Ingests the complete lines appended since the last poll.
    pub fn poll_once(&mut self) -> Result<PollOutcome, TailError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "waiting for file to appear");
                return Ok(PollOutcome::Missing);
            }
            Err(err) => return Err(self.io_err(err)),
        };
        let metadata = file.metadata().map_err(|e| self.io_err(e))?;
        let size = metadata.len();
        let identity = file_identity(&metadata);
        let start = self.resume_offset(size, &identity)?;

        if start >= size {
            return Ok(PollOutcome::Unchanged { offset: start });
        }

        file.seek(SeekFrom::Start(start))
            .map_err(|e| self.io_err(e))?;
        let budget = self.config.max_chunk_bytes.max(1);
        let mut chunk = Vec::new();
        file.take(budget)
            .read_to_end(&mut chunk)
            .map_err(|e| self.io_err(e))?;

        let complete = match chunk.iter().rposition(|b| *b == b'\n') {
            Some(last) => last + 1,
            // an overlong line is taken whole rather than stalling forever
            None if chunk.len() as u64 >= budget => chunk.len(),
            None => return Ok(PollOutcome::Unchanged { offset: start }),
        };

        let result = Ingestor::new(&mut *self.conn, self.options.clone())
            .ingest_reader(&chunk[..complete])?;
        let offset = start + complete as u64;
        self.store(&ReadOffset {
            byte_offset: offset,
            file_identity: identity,
        })?;

        info!(
            path = %self.path.display(),
            offset,
            inserted = result.inserted,
            duplicates = result.duplicates,
            malformed = result.malformed,
            "tail poll ingested"
        );
        Ok(PollOutcome::Ingested {
            result,
            offset,
            pending: offset < size,
        })
    }

    /// Polls until `signal` fires. Storage failures are logged and retried on
    /// the next poll from the last committed offset; read failures end the
    /// loop.
    pub fn run(&mut self, signal: &StopSignal) -> Result<BatchResult, TailError> {
        let mut total = BatchResult::default();
        loop {
            let mut pending = false;
            match self.poll_once() {
                Ok(PollOutcome::Ingested {
                    result,
                    pending: more,
                    ..
                }) => {
                    total.absorb(&result, self.options.malformed_sample_limit);
                    pending = more;
                }
                Ok(_) => {}
                Err(err @ TailError::Io { .. }) => return Err(err),
                Err(err) => error!(path = %self.path.display(), error = %err, "tail poll failed"),
            }

            let stopped = if pending {
                signal.is_stopped()
            } else {
                signal.wait(self.config.interval())
            };
            if stopped {
                info!(path = %self.path.display(), "tailing stopped");
                return Ok(total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::utils::stop_signal;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn line(i: usize) -> String {
        format!(
            "192.168.1.{} - - [11/Oct/2023:08:00:{:02} +0200] \"GET /tail/{} HTTP/1.1\" 200 64 \"-\" \"tailer\"\n",
            i % 250,
            i % 60,
            i
        )
    }

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn config(from_start: bool) -> TailConfig {
        TailConfig {
            from_start,
            ..TailConfig::default()
        }
    }

    fn inserted(outcome: PollOutcome) -> u64 {
        match outcome {
            PollOutcome::Ingested { result, .. } => result.inserted,
            other => panic!("expected an ingest, got {:?}", other),
        }
    }

    fn records(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM log_records", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn picks_up_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &format!("{}{}", line(0), line(1)));

        let mut conn = open_in_memory().unwrap();
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), config(true));
        assert_eq!(2, inserted(tailer.poll_once().unwrap()));
        assert!(matches!(
            tailer.poll_once().unwrap(),
            PollOutcome::Unchanged { .. }
        ));

        append(&path, &line(2));
        assert_eq!(1, inserted(tailer.poll_once().unwrap()));
        drop(tailer);
        assert_eq!(3, records(&conn));
    }

    #[test]
    fn starts_at_end_of_file_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &line(0));

        let mut conn = open_in_memory().unwrap();
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), config(false));
        assert!(matches!(
            tailer.poll_once().unwrap(),
            PollOutcome::Unchanged { .. }
        ));
        append(&path, &line(1));
        assert_eq!(1, inserted(tailer.poll_once().unwrap()));
    }

    #[test]
    fn waits_for_the_rest_of_a_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let full = line(0);
        let (head, tail) = full.split_at(20);
        append(&path, head);

        let mut conn = open_in_memory().unwrap();
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), config(true));
        assert_eq!(
            PollOutcome::Unchanged { offset: 0 },
            tailer.poll_once().unwrap()
        );
        append(&path, tail);
        assert_eq!(1, inserted(tailer.poll_once().unwrap()));
    }

    #[test]
    fn resumes_from_the_stored_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &format!("{}{}", line(0), line(1)));

        let mut conn = open_in_memory().unwrap();
        {
            let mut tailer =
                Tailer::new(&mut conn, &path, IngestOptions::default(), config(true));
            assert_eq!(2, inserted(tailer.poll_once().unwrap()));
        }
        append(&path, &line(2));
        {
            let mut tailer =
                Tailer::new(&mut conn, &path, IngestOptions::default(), config(true));
            match tailer.poll_once().unwrap() {
                PollOutcome::Ingested { result, .. } => {
                    assert_eq!(1, result.lines_read);
                    assert_eq!(0, result.duplicates);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(3, records(&conn));
    }

    #[test]
    fn truncation_resets_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &format!("{}{}{}", line(0), line(1), line(2)));

        let mut conn = open_in_memory().unwrap();
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), config(true));
        assert_eq!(3, inserted(tailer.poll_once().unwrap()));

        std::fs::write(&path, line(3)).unwrap();
        assert_eq!(1, inserted(tailer.poll_once().unwrap()));
        drop(tailer);
        assert_eq!(4, records(&conn));
    }

    #[cfg(unix)]
    #[test]
    fn rotation_resets_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &line(0));

        let mut conn = open_in_memory().unwrap();
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), config(true));
        assert_eq!(1, inserted(tailer.poll_once().unwrap()));

        std::fs::rename(&path, dir.path().join("access.log.1")).unwrap();
        // longer than the stored offset, only the identity gives it away
        append(&path, &format!("{}{}", line(1), line(2)));
        assert_eq!(2, inserted(tailer.poll_once().unwrap()));
    }

    #[test]
    fn overlong_lines_are_consumed_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &format!("{}{}", line(0), line(1)));

        let mut conn = open_in_memory().unwrap();
        let small = TailConfig {
            from_start: true,
            max_chunk_bytes: 40,
            ..TailConfig::default()
        };
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), small);
        match tailer.poll_once().unwrap() {
            PollOutcome::Ingested {
                result,
                offset,
                pending,
            } => {
                assert_eq!(40, offset);
                assert!(pending);
                assert_eq!(1, result.malformed);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_file_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");

        let mut conn = open_in_memory().unwrap();
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), config(true));
        assert_eq!(PollOutcome::Missing, tailer.poll_once().unwrap());

        append(&path, &line(0));
        assert_eq!(1, inserted(tailer.poll_once().unwrap()));
    }

    #[test]
    fn run_totals_keep_malformed_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &format!("{}not an access log line\n", line(0)));

        let mut conn = open_in_memory().unwrap();
        let slow = TailConfig {
            from_start: true,
            interval_secs: 3600,
            ..TailConfig::default()
        };
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), slow);
        let (handle, signal) = stop_signal();
        assert!(handle.stop());

        let total = tailer.run(&signal).unwrap();
        assert_eq!(1, total.malformed);
        assert_eq!(1, total.malformed_samples.len());
        assert_eq!(2, total.malformed_samples[0].line_number);
    }

    #[test]
    fn run_returns_once_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        append(&path, &format!("{}{}", line(0), line(1)));

        let mut conn = open_in_memory().unwrap();
        let slow = TailConfig {
            from_start: true,
            interval_secs: 3600,
            ..TailConfig::default()
        };
        let mut tailer = Tailer::new(&mut conn, &path, IngestOptions::default(), slow);
        let (handle, signal) = stop_signal();
        assert!(handle.stop());

        let total = tailer.run(&signal).unwrap();
        assert_eq!(2, total.inserted);
    }
}
