use sha2::{Digest, Sha256};

/// Length of the hex digest produced by [`line_digest`].
pub const DIGEST_LEN: usize = 64;

/// Content hash of one raw log line, line terminator excluded.
///
/// Identical bytes always give the same digest, so re-reading a file (or the
/// overlapping tail of a growing one) maps every line onto its existing row.
pub fn line_digest(raw: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_ref());
    hex::encode(hasher.finalize())
}

/// Strips a trailing `\n` or `\r\n`.
pub fn trim_line_terminator(raw: &[u8]) -> &[u8] {
    match raw.strip_suffix(b"\n") {
        Some(line) => line.strip_suffix(b"\r").unwrap_or(line),
        None => raw,
    }
}
