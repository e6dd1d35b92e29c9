//! Configuration for the read-ahead entry reader.

use std::time::Duration;

/// Configuration for a [`ReadAheadEntryReader`](crate::ReadAheadEntryReader).
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Pause threshold of the entry queue.
    ///
    /// The read-ahead stops issuing reads once the queue holds at least this
    /// many entries; the queue may briefly exceed the threshold by at most
    /// one batch. Consuming entries below the threshold resumes the
    /// read-ahead.
    pub read_ahead_max_records: usize,

    /// Number of entries requested per read against the segment store.
    pub read_ahead_batch_size: usize,

    /// Period of the idle reader check.
    ///
    /// When the reader has produced nothing for longer than this and looks
    /// stuck (no current segment, or the current segment is exhausted up to
    /// its LAC), the segment list is refreshed from the metadata source.
    /// `None` disables the check.
    pub idle_warn_threshold: Option<Duration>,

    /// When true, positioning at truncated offsets is allowed.
    pub ignore_truncation_status: bool,

    /// When true, positioning on a partially truncated segment raises a
    /// metric alert (even when truncation is otherwise ignored).
    pub alert_when_positioning_on_truncated: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_ahead_max_records: 10,
            read_ahead_batch_size: 4,
            idle_warn_threshold: Some(Duration::from_secs(120)),
            ignore_truncation_status: false,
            alert_when_positioning_on_truncated: false,
        }
    }
}
