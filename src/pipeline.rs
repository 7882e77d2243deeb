use crate::config::IngestConfig;
use crate::db::loader::BatchLoader;
use crate::digest::trim_line_terminator;
use crate::error::IngestError;
use crate::models::{BatchResult, LogRecord, MalformedLine};
use crate::parser::LineParser;
use rusqlite::Connection;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub max_path_length: usize,
    /// Upper bound for [`Ingestor::ingest_file`], in bytes.
    pub max_file_size: u64,
    pub malformed_sample_limit: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for IngestOptions {
    fn from(config: &IngestConfig) -> Self {
        IngestOptions {
            batch_size: config.batch_size.max(1),
            max_path_length: config.max_path_length.max(1),
            max_file_size: config.max_file_size_bytes(),
            malformed_sample_limit: config.malformed_sample_limit,
        }
    }
}

impl IngestOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stage {
    Idle,
    Reading,
    Parsing,
    Batching,
    Flushing,
    Done,
}

/// Streams lines through the parser into batches and hands full batches to
/// the loader, one at a time.
///
/// An ingestor is one run: its identity cache lives as long as it does.
pub struct Ingestor<'conn> {
    loader: BatchLoader<'conn>,
    parser: LineParser,
    options: IngestOptions,
    stage: Stage,
}

impl<'conn> Ingestor<'conn> {
    pub fn new(conn: &'conn mut Connection, options: IngestOptions) -> Ingestor<'conn> {
        Ingestor {
            loader: BatchLoader::new(conn),
            parser: LineParser::new(options.max_path_length.max(1)),
            options,
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn ingest_file(&mut self, path: impl AsRef<Path>) -> Result<BatchResult, IngestError> {
        let path = path.as_ref();
        let io_err = |source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        };

        let size = std::fs::metadata(path).map_err(io_err)?.len();
        if size > self.options.max_file_size {
            return Err(IngestError::FileTooLarge {
                path: path.to_path_buf(),
                size,
                limit: self.options.max_file_size,
            });
        }

        info!(path = %path.display(), size, "ingesting file");
        let file = File::open(path).map_err(io_err)?;
        self.ingest_from(BufReader::new(file), path)
    }

    pub fn ingest_reader<R: BufRead>(&mut self, reader: R) -> Result<BatchResult, IngestError> {
        self.ingest_from(reader, Path::new("<input>"))
    }

    fn ingest_from<R: BufRead>(
        &mut self,
        mut reader: R,
        origin: &Path,
    ) -> Result<BatchResult, IngestError> {
        let batch_size = self.options.batch_size.max(1);
        let mut result = BatchResult::default();
        let mut batch: Vec<LogRecord> = Vec::with_capacity(batch_size);
        let mut buf = Vec::new();
        // lines_read at the end of the last committed batch
        let mut committed_through = 0;

        loop {
            self.stage = Stage::Reading;
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| IngestError::Io {
                    path: origin.to_path_buf(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            result.lines_read += 1;

            self.stage = Stage::Parsing;
            match self.parser.parse_raw(trim_line_terminator(&buf)) {
                Ok(record) => {
                    result.parsed += 1;
                    self.stage = Stage::Batching;
                    batch.push(record);
                }
                Err(failure) => {
                    result.malformed += 1;
                    warn!(
                        line_number = result.lines_read,
                        kind = %failure.kind,
                        token = %failure.token,
                        "skipping malformed line"
                    );
                    if result.malformed_samples.len() < self.options.malformed_sample_limit {
                        result.malformed_samples.push(MalformedLine {
                            line_number: result.lines_read,
                            kind: failure.kind,
                        });
                    }
                }
            }

            if batch.len() >= batch_size {
                self.flush(&mut batch, &mut result, committed_through)?;
                committed_through = result.lines_read;
            }
        }

        self.flush(&mut batch, &mut result, committed_through)?;
        self.stage = Stage::Done;
        info!(
            lines_read = result.lines_read,
            parsed = result.parsed,
            malformed = result.malformed,
            inserted = result.inserted,
            duplicates = result.duplicates,
            batches = result.batches_committed,
            "ingestion finished"
        );
        Ok(result)
    }

    fn flush(
        &mut self,
        batch: &mut Vec<LogRecord>,
        result: &mut BatchResult,
        committed_through: u64,
    ) -> Result<(), IngestError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.stage = Stage::Flushing;
        debug!(records = batch.len(), "flushing batch");
        match self.loader.load(batch) {
            Ok(outcome) => {
                result.inserted += outcome.inserted;
                result.duplicates += outcome.duplicates;
                result.batches_committed += 1;
                batch.clear();
                Ok(())
            }
            Err(source) => Err(IngestError::Storage {
                source,
                progress: result.clone(),
                resume_line: committed_through + 1,
            }),
        }
    }
}
