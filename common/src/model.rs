//! Core data types shared across the log reader seam.
//!
//! This module defines the coordinate system of the log ([`Dlsn`]), the unit
//! of reading ([`Entry`]), and the read-only segment snapshot
//! ([`LogSegmentMetadata`]) that the metadata source publishes.

use std::fmt;

use bytes::Bytes;

/// Sequence number of a log segment.
///
/// Segment sequence numbers are unique and monotonically increasing across
/// the life of a stream.
pub type SegmentSeqNo = u64;

/// Identifier of an entry within a log segment.
///
/// Entry ids start at 0 within each segment. A negative value is used as the
/// "nothing durable yet" sentinel for the LAC of a fresh in-progress segment.
pub type EntryId = i64;

/// A totally ordered log coordinate: `(segment sequence number, entry id,
/// slot id)`, compared lexicographically.
///
/// The reader core only uses the first two fields; the slot id addresses
/// records inside a batched entry and is carried for completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dlsn {
    /// Sequence number of the segment containing the entry.
    pub seg_seq_no: SegmentSeqNo,
    /// Entry id within the segment.
    pub entry_id: EntryId,
    /// Slot within the entry.
    pub slot_id: i64,
}

impl Dlsn {
    /// The first possible position of a stream.
    pub const INITIAL: Dlsn = Dlsn {
        seg_seq_no: 1,
        entry_id: 0,
        slot_id: 0,
    };

    /// Creates a DLSN at the first slot of `(seg_seq_no, entry_id)`.
    pub fn new(seg_seq_no: SegmentSeqNo, entry_id: EntryId) -> Self {
        Self {
            seg_seq_no,
            entry_id,
            slot_id: 0,
        }
    }
}

impl fmt::Display for Dlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.seg_seq_no, self.entry_id, self.slot_id)
    }
}

/// Lifecycle status of a log segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// The segment is the tail of the stream and is actively written; its
    /// LAC advances until the segment is closed.
    InProgress,
    /// The segment is immutable; its last DLSN is fixed.
    Closed,
}

/// Truncation state of a log segment.
///
/// Truncation is prefix deletion: a whole segment may be truncated away, or
/// a prefix within a segment may be deleted, leaving `min_active_dlsn` as
/// the first readable position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStatus {
    /// All entries of the segment are readable.
    Active,
    /// Entries before `min_active_dlsn` are no longer readable.
    PartiallyTruncated {
        /// The first readable position of the segment.
        min_active_dlsn: Dlsn,
    },
    /// The whole segment has been truncated away.
    Truncated,
}

/// Read-only snapshot of a log segment, as published by the metadata source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegmentMetadata {
    /// Sequence number of the segment.
    pub seg_seq_no: SegmentSeqNo,
    /// Whether the segment is in-progress or closed.
    pub status: SegmentStatus,
    /// Truncation state of the segment.
    pub truncation: TruncationStatus,
    /// The last DLSN of the segment. `None` while the segment is in-progress.
    pub last_dlsn: Option<Dlsn>,
}

impl LogSegmentMetadata {
    /// Creates the snapshot of an in-progress segment.
    pub fn in_progress(seg_seq_no: SegmentSeqNo) -> Self {
        Self {
            seg_seq_no,
            status: SegmentStatus::InProgress,
            truncation: TruncationStatus::Active,
            last_dlsn: None,
        }
    }

    /// Creates the snapshot of a closed segment ending at `last_dlsn`.
    pub fn closed(seg_seq_no: SegmentSeqNo, last_dlsn: Dlsn) -> Self {
        Self {
            seg_seq_no,
            status: SegmentStatus::Closed,
            truncation: TruncationStatus::Active,
            last_dlsn: Some(last_dlsn),
        }
    }

    /// Returns a copy of this snapshot with the given truncation state.
    pub fn with_truncation(mut self, truncation: TruncationStatus) -> Self {
        self.truncation = truncation;
        self
    }

    /// Returns whether the segment is still in-progress.
    pub fn is_in_progress(&self) -> bool {
        self.status == SegmentStatus::InProgress
    }

    /// Returns whether the whole segment has been truncated away.
    pub fn is_truncated(&self) -> bool {
        self.truncation == TruncationStatus::Truncated
    }

    /// Returns whether a prefix of the segment has been truncated.
    pub fn is_partially_truncated(&self) -> bool {
        matches!(self.truncation, TruncationStatus::PartiallyTruncated { .. })
    }

    /// Returns the first readable position of a partially truncated segment.
    pub fn min_active_dlsn(&self) -> Option<Dlsn> {
        match self.truncation {
            TruncationStatus::PartiallyTruncated { min_active_dlsn } => Some(min_active_dlsn),
            _ => None,
        }
    }
}

/// One readable unit of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Sequence number of the segment the entry belongs to.
    pub seg_seq_no: SegmentSeqNo,
    /// Entry id within the segment.
    pub entry_id: EntryId,
    /// The entry payload. The reader does not interpret its contents.
    pub payload: Bytes,
}

impl Entry {
    /// Returns the position of this entry.
    pub fn dlsn(&self) -> Dlsn {
        Dlsn::new(self.seg_seq_no, self.entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_order_dlsn_lexicographically() {
        // given
        let a = Dlsn::new(1, 5);
        let b = Dlsn::new(1, 6);
        let c = Dlsn::new(2, 0);

        // then
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_eq!(a, Dlsn::new(1, 5));
    }

    #[test]
    fn should_order_dlsn_by_slot_last() {
        // given
        let first_slot = Dlsn::new(3, 7);
        let later_slot = Dlsn {
            slot_id: 2,
            ..first_slot
        };

        // then
        assert!(first_slot < later_slot);
    }

    #[test]
    fn should_report_truncation_state() {
        // given
        let active = LogSegmentMetadata::closed(1, Dlsn::new(1, 9));
        let partial = LogSegmentMetadata::closed(2, Dlsn::new(2, 9)).with_truncation(
            TruncationStatus::PartiallyTruncated {
                min_active_dlsn: Dlsn::new(2, 3),
            },
        );
        let truncated =
            LogSegmentMetadata::closed(3, Dlsn::new(3, 9)).with_truncation(TruncationStatus::Truncated);

        // then
        assert!(!active.is_truncated() && !active.is_partially_truncated());
        assert!(partial.is_partially_truncated());
        assert_eq!(partial.min_active_dlsn(), Some(Dlsn::new(2, 3)));
        assert!(truncated.is_truncated());
        assert_eq!(truncated.min_active_dlsn(), None);
    }

    #[test]
    fn should_expose_entry_position() {
        // given
        let entry = Entry {
            seg_seq_no: 4,
            entry_id: 11,
            payload: Bytes::from_static(b"payload"),
        };

        // then
        assert_eq!(entry.dlsn(), Dlsn::new(4, 11));
    }
}
