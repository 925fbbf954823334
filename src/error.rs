//! Crate-wide error taxonomy.
//!
//! Every fallible boundary in this crate returns one of these variants. The
//! kinds are deliberately coarse — they mirror the eight-way taxonomy the
//! Shard contract promises callers, not the internal module structure.

use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Client supplied a point with a field-type conflicting an existing
    /// field, an undecodable tag value, or a key too large to encode.
    #[snafu(display("malformed input: {reason}"))]
    MalformedInput { reason: String },

    /// A lookup key (metric name, series id, tag value, ...) was absent.
    #[snafu(display("not found: {what}"))]
    NotFound { what: String },

    /// CRC mismatch, footer inconsistency, or truncated file.
    #[snafu(display("corrupted file {}: {reason}", path.display()))]
    Corrupted { path: PathBuf, reason: String },

    /// The write path attempted to build a KV entry with a non-monotone key.
    #[snafu(display("out of order write: key {key} is not greater than the last inserted key {last}"))]
    OutOfOrder { key: u64, last: u64 },

    /// A file handle was closed mid-flight because the shard is shutting down.
    #[snafu(display("unavailable: {reason}"))]
    Unavailable { reason: String },

    /// The in-memory write buffer exceeded its configured size budget.
    #[snafu(display("resource exhausted: memdb at {current} bytes exceeds budget {budget} bytes"))]
    ResourceExhausted { current: u64, budget: u64 },

    /// A query exceeded its deadline.
    #[snafu(display("query cancelled: deadline exceeded"))]
    Cancelled,

    /// An ID allocation raced and this attempt lost after exhausting retries.
    #[snafu(display("conflict allocating id for {what} after {attempts} attempts"))]
    Conflict { what: String, attempts: u32 },

    /// Wraps a lower-level I/O failure with the path it occurred against.
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedInput {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is safe to isolate to a single file/reader without
    /// taking the whole shard offline.
    pub fn is_isolated_to_reader(&self) -> bool {
        matches!(self, Error::Corrupted { .. } | Error::NotFound { .. })
    }
}
