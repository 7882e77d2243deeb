use crate::digest::line_digest;
use crate::models::{LogRecord, LogTimestamp};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Longest request path kept, in bytes. Longer paths are cut at a char boundary.
pub const DEFAULT_MAX_PATH_LENGTH: usize = 2048;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ParseFailureKind {
    MalformedLine,
    InvalidTimestamp,
    MalformedRequest,
    InvalidStatus,
    InvalidBytes,
}

impl ParseFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseFailureKind::MalformedLine => "malformed line",
            ParseFailureKind::InvalidTimestamp => "invalid timestamp",
            ParseFailureKind::MalformedRequest => "malformed request",
            ParseFailureKind::InvalidStatus => "invalid status",
            ParseFailureKind::InvalidBytes => "invalid bytes",
        }
    }
}

impl fmt::Display for ParseFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of a line did not match the access log grammar.
#[derive(Error, Clone, PartialEq, Eq, Debug)]
#[error("{kind}: '{token}'")]
pub struct ParseFailure {
    pub kind: ParseFailureKind,
    /// The offending field, or the whole line for structural failures.
    pub token: String,
}

impl ParseFailure {
    fn new(kind: ParseFailureKind, token: impl Into<String>) -> Self {
        ParseFailure {
            kind,
            token: token.into(),
        }
    }
}

// https://httpd.apache.org/docs/2.4/logs.html
// Quoted fields may contain backslash escapes (\"), kept verbatim.
static COMBINED_LOG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<ip>[^ ]+) - - \[(?P<timestamp>[^\]]*)\] "(?P<request>(?:[^"\\]|\\.)*)" (?P<status>[^ ]+) (?P<bytes>[^ ]+) "(?P<referrer>(?:[^"\\]|\\.)*)" "(?P<useragent>(?:[^"\\]|\\.)*)""#,
    ).unwrap()
});

#[derive(Clone, Debug)]
pub struct LineParser {
    max_path_length: usize,
}

impl Default for LineParser {
    fn default() -> Self {
        LineParser::new(DEFAULT_MAX_PATH_LENGTH)
    }
}

impl LineParser {
    pub fn new(max_path_length: usize) -> Self {
        LineParser { max_path_length }
    }

    /// Parses raw line bytes (terminator already stripped). Invalid UTF-8 is
    /// decoded lossily, the digest is always taken over the original bytes.
    pub fn parse_raw(&self, raw: &[u8]) -> Result<LogRecord, ParseFailure> {
        let line: Cow<str> = String::from_utf8_lossy(raw);
        let mut record = self.parse_fields(&line)?;
        record.digest = line_digest(raw);
        Ok(record)
    }

    pub fn parse(&self, line: &str) -> Result<LogRecord, ParseFailure> {
        self.parse_raw(line.as_bytes())
    }

    fn parse_fields(&self, line: &str) -> Result<LogRecord, ParseFailure> {
        let captures = COMBINED_LOG_REGEX
            .captures(line)
            .ok_or_else(|| ParseFailure::new(ParseFailureKind::MalformedLine, line))?;
        let field = |name: &str| captures.name(name).map_or("", |m| m.as_str());

        let timestamp = LogTimestamp::parse_clf(field("timestamp")).ok_or_else(|| {
            ParseFailure::new(ParseFailureKind::InvalidTimestamp, field("timestamp"))
        })?;
        let (method, path, protocol) = self.parse_request(field("request"))?;
        let status_code = parse_status(field("status"))?;
        let bytes_sent = parse_bytes(field("bytes"))?;

        Ok(LogRecord {
            client_address: field("ip").to_owned(),
            timestamp,
            method,
            path,
            protocol,
            status_code,
            bytes_sent,
            referrer: optional_quoted(&captures, "referrer"),
            useragent: optional_quoted(&captures, "useragent"),
            digest: String::new(),
        })
    }

    fn parse_request(
        &self,
        request: &str,
    ) -> Result<(String, String, Option<String>), ParseFailure> {
        let mut parts = request.splitn(3, ' ');
        let method = parts.next().filter(|m| !m.is_empty());
        let path = parts.next().filter(|p| !p.is_empty());
        let (method, path) = match (method, path) {
            (Some(method), Some(path)) => (method, path),
            _ => {
                return Err(ParseFailure::new(
                    ParseFailureKind::MalformedRequest,
                    request,
                ))
            }
        };
        let protocol = parts.next().filter(|p| !p.is_empty()).map(str::to_owned);
        Ok((
            method.to_owned(),
            truncate_at_boundary(path, self.max_path_length).to_owned(),
            protocol,
        ))
    }
}

/// Parses a line with the default path limit.
pub fn parse_line(line: &str) -> Result<LogRecord, ParseFailure> {
    LineParser::default().parse(line)
}

fn parse_status(token: &str) -> Result<u16, ParseFailure> {
    let invalid = || ParseFailure::new(ParseFailureKind::InvalidStatus, token);
    if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let status = token.parse::<u16>().map_err(|_| invalid())?;
    if !(100..=599).contains(&status) {
        return Err(invalid());
    }
    Ok(status)
}

fn parse_bytes(token: &str) -> Result<u64, ParseFailure> {
    if token == "-" {
        return Ok(0);
    }
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseFailure::new(ParseFailureKind::InvalidBytes, token));
    }
    // stored as a signed 64-bit integer
    token
        .parse::<i64>()
        .ok()
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or_else(|| ParseFailure::new(ParseFailureKind::InvalidBytes, token))
}

fn optional_quoted(captures: &Captures, name: &str) -> Option<String> {
    captures
        .name(name)
        .map(|m| m.as_str())
        .filter(|value| *value != "-")
        .map(str::to_owned)
}

fn truncate_at_boundary(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::line_digest;

    const EXAMPLE: &str = r#"127.0.0.1 - - [10/Oct/2023:13:55:36 +0000] "GET /index.html HTTP/1.1" 200 1234 "http://example.com/" "Mozilla/5.0""#;

    fn kind_of(line: &str) -> ParseFailureKind {
        parse_line(line).unwrap_err().kind
    }

    #[test]
    fn parses_example_line() {
        let record = parse_line(EXAMPLE).unwrap();
        assert_eq!("127.0.0.1", record.client_address);
        assert_eq!("GET", record.method);
        assert_eq!("/index.html", record.path);
        assert_eq!(Some("HTTP/1.1".to_owned()), record.protocol);
        assert_eq!(200, record.status_code);
        assert_eq!(1234, record.bytes_sent);
        assert_eq!(Some("http://example.com/".to_owned()), record.referrer);
        assert_eq!(Some("Mozilla/5.0".to_owned()), record.useragent);
        assert_eq!("2023-10-10 13:55:36", record.timestamp.to_storage());
        assert_eq!(line_digest(EXAMPLE), record.digest);
    }

    #[test]
    fn dash_markers_become_absent() {
        let record = parse_line(
            r#"192.168.1.1 - - [10/Oct/2000:13:55:37 -0700] "POST /login HTTP/1.1" 302 - "-" "-""#,
        )
        .unwrap();
        assert_eq!(0, record.bytes_sent);
        assert_eq!(None, record.referrer);
        assert_eq!(None, record.useragent);
    }

    #[test]
    fn empty_quoted_values_are_kept() {
        let record =
            parse_line(r#"::1 - - [10/Oct/2000:13:55:37 +0200] "GET / HTTP/1.0" 204 0 "" """#)
                .unwrap();
        assert_eq!("::1", record.client_address);
        assert_eq!(Some(String::new()), record.referrer);
        assert_eq!(Some(String::new()), record.useragent);
    }

    #[test]
    fn timestamp_without_offset_is_accepted() {
        let record =
            parse_line(r#"10.0.0.1 - - [10/Oct/2000:13:55:36] "GET / HTTP/1.1" 200 10 "-" "-""#)
                .unwrap();
        assert_eq!(None, record.timestamp.utc_offset_seconds());
    }

    #[test]
    fn protocol_is_optional() {
        let record =
            parse_line(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET /x" 200 10 "-" "-""#)
                .unwrap();
        assert_eq!("/x", record.path);
        assert_eq!(None, record.protocol);
    }

    #[test]
    fn escaped_quotes_stay_verbatim() {
        let record = parse_line(
            r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 200 10 "-" "Agent \"quoted\" 1.0""#,
        )
        .unwrap();
        assert_eq!(Some(r#"Agent \"quoted\" 1.0"#.to_owned()), record.useragent);
    }

    #[test]
    fn structural_failures_are_malformed_line() {
        assert_eq!(
            ParseFailureKind::MalformedLine,
            kind_of("malformed log line without proper format")
        );
        assert_eq!(ParseFailureKind::MalformedLine, kind_of(""));
        // missing bytes field
        assert_eq!(
            ParseFailureKind::MalformedLine,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 200 "-" "-""#)
        );
        // missing closing bracket
        assert_eq!(
            ParseFailureKind::MalformedLine,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000 "GET / HTTP/1.1" 200 1 "-" "-""#)
        );
        // unquoted user agent
        assert_eq!(
            ParseFailureKind::MalformedLine,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 200 1 "-" curl"#)
        );
    }

    #[test]
    fn field_failures_are_attributed() {
        assert_eq!(
            ParseFailureKind::InvalidTimestamp,
            kind_of(r#"10.0.0.1 - - [invalid-timestamp] "GET / HTTP/1.1" 200 1234 "-" "-""#)
        );
        assert_eq!(
            ParseFailureKind::MalformedRequest,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET" 200 1 "-" "-""#)
        );
        assert_eq!(
            ParseFailureKind::MalformedRequest,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "" 200 1 "-" "-""#)
        );
        assert_eq!(
            ParseFailureKind::InvalidStatus,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 20x 1 "-" "-""#)
        );
        assert_eq!(
            ParseFailureKind::InvalidStatus,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 2000 1 "-" "-""#)
        );
        assert_eq!(
            ParseFailureKind::InvalidBytes,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 200 -5 "-" "-""#)
        );
        assert_eq!(
            ParseFailureKind::InvalidBytes,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 200 12k "-" "-""#)
        );
        // one past i64::MAX cannot be stored
        assert_eq!(
            ParseFailureKind::InvalidBytes,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 200 9223372036854775808 "-" "-""#)
        );
        let largest = parse_line(
            r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 200 9223372036854775807 "-" "-""#,
        )
        .unwrap();
        assert_eq!(i64::MAX as u64, largest.bytes_sent);
    }

    #[test]
    fn out_of_range_status_is_rejected() {
        assert_eq!(
            ParseFailureKind::InvalidStatus,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 999 1 "-" "-""#)
        );
        assert_eq!(
            ParseFailureKind::InvalidStatus,
            kind_of(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET / HTTP/1.1" 042 1 "-" "-""#)
        );
    }

    #[test]
    fn long_paths_are_truncated() {
        let parser = LineParser::new(8);
        let record = parser
            .parse(r#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET /abcdefghijkl HTTP/1.1" 200 1 "-" "-""#)
            .unwrap();
        assert_eq!("/abcdefg", record.path);

        // never splits a multi-byte character
        assert_eq!("/ab", truncate_at_boundary("/abé", 4));
    }

    #[test]
    fn canonical_line_round_trips() {
        let lines = [
            EXAMPLE,
            r#"203.0.113.1 - - [10/Oct/2000:13:55:38 -0700] "GET /nonexistent HTTP/1.1" 404 1234 "-" "Mozilla/5.0 (Linux; Android 10; SM-G973F)""#,
            r#"2001:db8::1 - - [29/Feb/2024:23:59:59] "DELETE /api/items/7" 500 0 "" "-""#,
        ];
        for line in lines {
            let record = parse_line(line).unwrap();
            let formatted = record.to_line();
            assert_eq!(line, formatted);
            assert_eq!(record, parse_line(&formatted).unwrap());
        }
    }

    fn without_digest(record: &LogRecord) -> LogRecord {
        LogRecord {
            digest: String::new(),
            ..record.clone()
        }
    }

    #[test]
    fn non_canonical_line_reparses_to_same_fields() {
        let lines = [
            r#"10.0.0.9 - - [10/Oct/2023:13:55:36 +0000] "GET /padded HTTP/1.1" 200 0012 "-" "curl/8.4.0""#,
            r#"10.0.0.9 - - [10/Oct/2023:13:55:36 +0000] "GET /extra HTTP/1.1" 200 12 "-" "curl/8.4.0" rt=0.004"#,
        ];
        for line in lines {
            let record = parse_line(line).unwrap();
            let formatted = record.to_line();
            assert_ne!(line, formatted);
            let reparsed = parse_line(&formatted).unwrap();
            assert_ne!(record.digest, reparsed.digest);
            assert_eq!(without_digest(&record), without_digest(&reparsed));
        }
    }

    #[test]
    fn invalid_utf8_still_parses_with_raw_digest() {
        let mut raw = br#"10.0.0.1 - - [10/Oct/2000:13:55:36 +0000] "GET /caf"#.to_vec();
        raw.push(0xff);
        raw.extend_from_slice(br#" HTTP/1.1" 200 1 "-" "-""#);
        let record = LineParser::default().parse_raw(&raw).unwrap();
        assert_eq!("/caf\u{fffd}", record.path);
        assert_eq!(line_digest(&raw), record.digest);
    }
}
