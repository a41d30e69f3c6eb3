//! WAL error types.

use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write handle poisoned by an earlier I/O failure")]
    Poisoned,

    #[error("record truncated at offset {offset} in segment {segment}")]
    TruncatedRecord { segment: u64, offset: u32 },

    #[error("corrupt record at offset {offset} in segment {segment}: {reason}")]
    CorruptRecord {
        segment: u64,
        offset: u32,
        reason: String,
    },

    #[error("unknown record type {tag} at offset {offset} in segment {segment}")]
    UnknownType { segment: u64, offset: u32, tag: u8 },

    #[error("segment {segment} written by serializer version {found}, expected {expected}")]
    UnsupportedVersion {
        segment: u64,
        found: u16,
        expected: u16,
    },

    #[error("replay start segment {requested} precedes earliest archived segment {earliest}")]
    HistoryTruncated { requested: u64, earliest: u64 },

    #[error("log corrupted: {0}")]
    CorruptLog(String),

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("WAL is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid WAL state: {0}")]
    InvalidState(String),
}

impl WalError {
    /// Returns whether this error may disappear on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_))
    }
}
