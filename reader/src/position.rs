//! The reader's entry position cursor.

use std::sync::Mutex;

use dlog_common::{Dlsn, EntryId, SegmentSeqNo};

/// Monotonic cursor tracking the next entry the read-ahead will deliver.
///
/// Advanced to one past the last entry of every delivered batch; never moves
/// backwards.
#[derive(Debug)]
pub(crate) struct EntryPosition {
    position: Mutex<Dlsn>,
}

impl EntryPosition {
    pub(crate) fn new(seg_seq_no: SegmentSeqNo, entry_id: EntryId) -> Self {
        Self {
            position: Mutex::new(Dlsn::new(seg_seq_no, entry_id)),
        }
    }

    /// Returns the current position.
    pub(crate) fn current(&self) -> Dlsn {
        *self.position.lock().expect("lock poisoned")
    }

    /// Advances to `(seg_seq_no, entry_id)` if that is a strictly larger
    /// position. Returns whether the cursor moved.
    pub(crate) fn advance(&self, seg_seq_no: SegmentSeqNo, entry_id: EntryId) -> bool {
        let mut position = self.position.lock().expect("lock poisoned");
        let candidate = Dlsn::new(seg_seq_no, entry_id);
        if candidate > *position {
            *position = candidate;
            true
        } else {
            false
        }
    }
}
