use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "weblog.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("weblogs.db")
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
    #[serde(default = "default_malformed_sample_limit")]
    pub malformed_sample_limit: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_file_size_mb: default_max_file_size_mb(),
            max_path_length: default_max_path_length(),
            malformed_sample_limit: default_malformed_sample_limit(),
        }
    }
}

impl IngestConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_max_file_size_mb() -> u64 {
    100
}
fn default_max_path_length() -> usize {
    crate::parser::DEFAULT_MAX_PATH_LENGTH
}
fn default_malformed_sample_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TailConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub from_start: bool,
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            from_start: false,
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

impl TailConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval_secs() -> u64 {
    5
}
fn default_max_chunk_bytes() -> u64 {
    8 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Loads settings from `path`. Without an explicit path, `weblog.toml` in
    /// the working directory is used when present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)?
                } else {
                    Settings::default()
                }
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Settings, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.database.path.as_os_str().is_empty() {
            return invalid("database.path must not be empty");
        }
        if self.ingest.batch_size == 0 {
            return invalid("ingest.batch_size must be at least 1");
        }
        if self.ingest.max_file_size_mb == 0 {
            return invalid("ingest.max_file_size_mb must be at least 1");
        }
        if self.ingest.max_path_length == 0 {
            return invalid("ingest.max_path_length must be at least 1");
        }
        if self.tail.interval_secs == 0 {
            return invalid("tail.interval_secs must be at least 1");
        }
        if self.tail.max_chunk_bytes == 0 {
            return invalid("tail.max_chunk_bytes must be at least 1");
        }
        Ok(())
    }
}
