//! The segment entry store interface consumed by the read-ahead reader.
//!
//! The entry store knows how to open a reader over a single log segment.
//! Segment readers hand out batches of entries in order, track the LAC of
//! in-progress segments, and notify listeners when an in-progress reader
//! first catches up with the LAC.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{Entry, EntryId, LogSegmentMetadata};

mod memory;

pub use memory::MemoryEntryStore;

/// Factory for per-segment entry readers.
#[async_trait]
pub trait LogSegmentEntryStore: Send + Sync {
    /// Opens a reader over `segment`, positioned at `start_entry_id`.
    async fn open_reader(
        &self,
        segment: LogSegmentMetadata,
        start_entry_id: EntryId,
    ) -> StoreResult<Arc<dyn LogSegmentEntryReader>>;
}

/// A reader over a single log segment.
///
/// Reads are ordered: each `read_next` returns the batch following the one
/// before it. On an in-progress segment a read past the LAC waits until the
/// LAC advances or the segment is closed; on a closed segment it fails with
/// [`StoreError::EndOfLogSegment`](crate::StoreError::EndOfLogSegment).
#[async_trait]
pub trait LogSegmentEntryReader: Send + Sync {
    /// Starts the reader (e.g. begins LAC tracking on an in-progress
    /// segment). Idempotent.
    fn start(&self);

    /// Reads up to `num_entries` entries at the current position.
    async fn read_next(&self, num_entries: usize) -> StoreResult<Vec<Entry>>;

    /// Informs the reader that the segment's metadata changed (notably the
    /// in-progress to closed transition).
    fn on_segment_metadata_updated(&self, segment: LogSegmentMetadata);

    /// Registers a listener for the caught-up-on-in-progress transition.
    fn register_listener(&self, listener: Arc<dyn EntryReaderListener>);

    /// Closes the reader, cancelling any outstanding read.
    async fn close(&self) -> StoreResult<()>;

    /// Returns whether the reader has no more readable entries at or below
    /// the LAC.
    fn is_beyond_last_add_confirmed(&self) -> bool;

    /// Returns whether the reader has caught up with the LAC of an
    /// in-progress segment at some point.
    fn has_caught_up_on_inprogress(&self) -> bool;

    /// Returns the last add confirmed entry id, or a negative value if
    /// nothing is durable yet.
    fn last_add_confirmed(&self) -> EntryId;

    /// Returns the reader's view of the segment metadata.
    fn segment(&self) -> LogSegmentMetadata;
}

/// Listener for segment reader state changes.
pub trait EntryReaderListener: Send + Sync {
    /// Called when an in-progress segment reader first catches up with the
    /// LAC.
    fn on_caught_up_on_inprogress(&self);
}
