use chrono::{DateTime, FixedOffset, NaiveDateTime};
use std::fmt;
use std::str::FromStr;

const CLF_WITH_OFFSET: &str = "%d/%b/%Y:%H:%M:%S %z";
const CLF_NAIVE: &str = "%d/%b/%Y:%H:%M:%S";
const STORAGE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Request time exactly as written in the log. The offset, when present, is
/// kept alongside the wall-clock value and never used to convert it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LogTimestamp {
    Offset(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl LogTimestamp {
    /// Wall-clock time as it appeared in the line.
    pub fn local(&self) -> NaiveDateTime {
        match self {
            LogTimestamp::Offset(dt) => dt.naive_local(),
            LogTimestamp::Naive(dt) => *dt,
        }
    }

    pub fn utc_offset_seconds(&self) -> Option<i32> {
        match self {
            LogTimestamp::Offset(dt) => Some(dt.offset().local_minus_utc()),
            LogTimestamp::Naive(_) => None,
        }
    }

    pub fn to_storage(&self) -> String {
        self.local().format(STORAGE_FORMAT).to_string()
    }

    /// Bracket contents in the access log format.
    pub fn to_clf(&self) -> String {
        match self {
            LogTimestamp::Offset(dt) => dt.format(CLF_WITH_OFFSET).to_string(),
            LogTimestamp::Naive(dt) => dt.format(CLF_NAIVE).to_string(),
        }
    }

    pub(crate) fn parse_clf(text: &str) -> Option<LogTimestamp> {
        if let Ok(dt) = DateTime::parse_from_str(text, CLF_WITH_OFFSET) {
            return Some(LogTimestamp::Offset(dt));
        }
        NaiveDateTime::parse_from_str(text, CLF_NAIVE)
            .ok()
            .map(LogTimestamp::Naive)
    }
}

/// One successfully parsed access log line.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct LogRecord {
    pub client_address: String,
    pub timestamp: LogTimestamp,
    pub method: String,
    pub path: String,
    pub protocol: Option<String>,
    pub status_code: u16,
    pub bytes_sent: u64,
    pub referrer: Option<String>,
    pub useragent: Option<String>,
    /// Hex digest of the raw line, the natural key of the stored row.
    pub digest: String,
}

impl LogRecord {
    /// Formats the record back into its canonical log line.
    pub fn to_line(&self) -> String {
        let request = match &self.protocol {
            Some(proto) => format!("{} {} {}", self.method, self.path, proto),
            None => format!("{} {}", self.method, self.path),
        };
        format!(
            r#"{} - - [{}] "{}" {} {} "{}" "{}""#,
            self.client_address,
            self.timestamp.to_clf(),
            request,
            self.status_code,
            self.bytes_sent,
            self.referrer.as_deref().unwrap_or("-"),
            self.useragent.as_deref().unwrap_or("-"),
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "Desktop",
            DeviceType::Mobile => "Mobile",
            DeviceType::Tablet => "Tablet",
            DeviceType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Desktop" => Ok(DeviceType::Desktop),
            "Mobile" => Ok(DeviceType::Mobile),
            "Tablet" => Ok(DeviceType::Tablet),
            "Unknown" => Ok(DeviceType::Unknown),
            other => Err(format!("unknown device type '{}'", other)),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct UserAgentIdentity {
    pub raw: String,
    pub os: String,
    pub browser: String,
    pub device_type: DeviceType,
}

/// A line that failed to parse, kept for the run summary.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MalformedLine {
    pub line_number: u64,
    pub kind: crate::parser::ParseFailureKind,
}

/// Counters for one ingestion run.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct BatchResult {
    pub lines_read: u64,
    pub parsed: u64,
    pub malformed: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub batches_committed: u64,
    pub malformed_samples: Vec<MalformedLine>,
}

impl BatchResult {
    /// Adds the counts of `other`, keeping at most `sample_limit` malformed samples.
    pub fn absorb(&mut self, other: &BatchResult, sample_limit: usize) {
        self.lines_read += other.lines_read;
        self.parsed += other.parsed;
        self.malformed += other.malformed;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.batches_committed += other.batches_committed;
        let room = sample_limit.saturating_sub(self.malformed_samples.len());
        self.malformed_samples
            .extend(other.malformed_samples.iter().take(room).cloned());
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read {} lines: {} parsed, {} malformed; {} inserted, {} duplicates in {} batches",
            self.lines_read,
            self.parsed,
            self.malformed,
            self.inserted,
            self.duplicates,
            self.batches_committed
        )
    }
}
