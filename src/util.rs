//! Shared utility functions

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a timestamp the way the log store expects it: UTC, millisecond
/// precision, `Z` suffix. Every `receivedAt`/`processedAt` value and every
/// pruning cutoff goes through this so lexicographic comparison in SQL
/// matches chronological order.
pub fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate a string to at most `max_chars` characters.
///
/// Character-based rather than byte-based: the limit applies to what a human
/// would count, and slicing at a char boundary keeps the result valid UTF-8.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// CRC-32 (ISO-HDLC) over the concatenation of `parts`, rendered as the
/// decimal form of the unsigned 32-bit value.
pub fn crc32_decimal(parts: &[&str]) -> String {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_string()
}
