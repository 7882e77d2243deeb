use crate::models::BatchResult;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the SQLite layer. Expected duplicate digests never show up
/// here, they are counted by the loader instead.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is {size} bytes, larger than the {limit} byte limit", .path.display())]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("batch aborted after {} committed batches, resume from line {resume_line}: {source}", .progress.batches_committed)]
    Storage {
        #[source]
        source: StorageError,
        progress: BatchResult,
        /// First line whose batch was not committed.
        resume_line: u64,
    },
}

#[derive(Error, Debug)]
pub enum TailError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
