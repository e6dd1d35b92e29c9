//! Error types for the segment entry store seam.

use crate::model::SegmentSeqNo;

/// Error type for segment entry store operations.
///
/// `EndOfLogSegment` is a control-flow signal rather than a failure: readers
/// of closed segments report it when the position moves past the last entry,
/// and the consumer of the store converts it into segment advancement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The reader moved past the last entry of a closed segment.
    EndOfLogSegment(SegmentSeqNo),
    /// The requested segment does not exist in the store.
    SegmentNotFound(SegmentSeqNo),
    /// The reader was closed while a read was outstanding.
    ReadCancelled(SegmentSeqNo),
    /// Failure in the underlying storage layer.
    Storage(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::EndOfLogSegment(seq) => {
                write!(f, "reached the end of log segment {}", seq)
            }
            StoreError::SegmentNotFound(seq) => write!(f, "log segment {} not found", seq),
            StoreError::ReadCancelled(seq) => {
                write!(f, "read on log segment {} cancelled by close", seq)
            }
            StoreError::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result type alias for segment entry store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
