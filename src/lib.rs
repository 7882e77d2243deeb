pub mod config;
pub mod db;
pub mod digest;
pub mod error;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod tail;
pub mod useragent;
pub mod utils;

pub use config::Settings;
pub use error::{ConfigError, IngestError, StorageError, TailError};
pub use models::{BatchResult, LogRecord, LogTimestamp};
pub use parser::{parse_line, LineParser, ParseFailure, ParseFailureKind};
pub use pipeline::{IngestOptions, Ingestor, Stage};
pub use tail::{PollOutcome, Tailer};
