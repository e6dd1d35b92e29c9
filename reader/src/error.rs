//! Error types for the read-ahead entry reader.
//!
//! This module defines [`Error`], the primary error type surfaced to the
//! consumer of the reader, along with a convenient [`Result`] type alias.
//!
//! Fatal errors are sticky: the first one wins and every subsequent consumer
//! call re-raises it until the reader is closed. The store's end-of-segment
//! signal never appears here; the reader converts it into segment
//! advancement.

use dlog_common::StoreError;

/// Error type for read-ahead reader operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Positioning the reader at a DLSN that has been truncated away.
    AlreadyTruncated(String),
    /// The observed segment metadata contradicts the reader's state, e.g. a
    /// segment sequence mismatch or a closed segment turning in-progress.
    InconsistentMetadata(String),
    /// The log stream has been deleted.
    LogNotFound(String),
    /// Failure from the segment entry store.
    Storage(String),
    /// Unexpected non-storage failure.
    Unexpected(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AlreadyTruncated(msg) => write!(f, "already truncated: {}", msg),
            Error::InconsistentMetadata(msg) => write!(f, "inconsistent metadata: {}", msg),
            Error::LogNotFound(msg) => write!(f, "log not found: {}", msg),
            Error::Storage(msg) => write!(f, "storage error: {}", msg),
            Error::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            // handled by the read-ahead loop before conversion
            StoreError::EndOfLogSegment(seq) => Error::Unexpected(format!(
                "end of log segment {} escaped the read ahead loop",
                seq
            )),
            StoreError::SegmentNotFound(seq) => {
                Error::Storage(format!("log segment {} not found", seq))
            }
            StoreError::ReadCancelled(seq) => {
                Error::Storage(format!("read on log segment {} cancelled", seq))
            }
            StoreError::Storage(msg) => Error::Storage(msg),
        }
    }
}

/// Result type alias for read-ahead reader operations.
pub type Result<T> = std::result::Result<T, Error>;
