//! The segment metadata source consumed by the read-ahead reader.
//!
//! The metadata source resolves the current segment list on demand (the
//! reader's idle detector pulls it when the pipeline looks stuck) and pushes
//! updates to registered [`LogSegmentListener`]s as the list changes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::LogSegmentMetadata;

/// Pull-side access to the segment list of a stream.
#[async_trait]
pub trait LogSegmentMetadataStore: Send + Sync {
    /// Reads the current segment list, ordered by segment sequence number.
    async fn log_segments(&self) -> StoreResult<Vec<LogSegmentMetadata>>;
}

/// Push-side notifications about a stream's segment list.
pub trait LogSegmentListener: Send + Sync {
    /// The segment list changed; `segments` is the complete new list in
    /// segment sequence order.
    fn on_segments_updated(&self, segments: Vec<LogSegmentMetadata>);

    /// The stream itself was deleted.
    fn on_log_stream_deleted(&self);
}

/// An in-memory metadata source.
///
/// Tests and local development drive it with
/// [`update_segments`](MemoryMetadataStore::update_segments) and
/// [`delete_stream`](MemoryMetadataStore::delete_stream); registered
/// listeners observe each change.
#[derive(Default)]
pub struct MemoryMetadataStore {
    segments: Mutex<Vec<LogSegmentMetadata>>,
    listeners: Mutex<Vec<Arc<dyn LogSegmentListener>>>,
}

impl MemoryMetadataStore {
    /// Creates an empty metadata store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for segment list changes.
    pub fn add_listener(&self, listener: Arc<dyn LogSegmentListener>) {
        self.listeners
            .lock()
            .expect("lock poisoned")
            .push(listener);
    }

    /// Replaces the segment list and notifies listeners.
    pub fn update_segments(&self, mut segments: Vec<LogSegmentMetadata>) {
        segments.sort_by_key(|segment| segment.seg_seq_no);
        *self.segments.lock().expect("lock poisoned") = segments.clone();
        for listener in self.listener_snapshot() {
            listener.on_segments_updated(segments.clone());
        }
    }

    /// Marks the stream deleted and notifies listeners.
    pub fn delete_stream(&self) {
        for listener in self.listener_snapshot() {
            listener.on_log_stream_deleted();
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn LogSegmentListener>> {
        self.listeners.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl LogSegmentMetadataStore for MemoryMetadataStore {
    async fn log_segments(&self) -> StoreResult<Vec<LogSegmentMetadata>> {
        Ok(self.segments.lock().expect("lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dlsn;

    struct RecordingListener {
        updates: Mutex<Vec<Vec<LogSegmentMetadata>>>,
        deleted: Mutex<bool>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                updates: Mutex::new(Vec::new()),
                deleted: Mutex::new(false),
            })
        }
    }

    impl LogSegmentListener for RecordingListener {
        fn on_segments_updated(&self, segments: Vec<LogSegmentMetadata>) {
            self.updates.lock().unwrap().push(segments);
        }

        fn on_log_stream_deleted(&self) {
            *self.deleted.lock().unwrap() = true;
        }
    }

    #[tokio::test]
    async fn should_return_segments_in_sequence_order() {
        // given
        let store = MemoryMetadataStore::new();
        store.update_segments(vec![
            LogSegmentMetadata::closed(2, Dlsn::new(2, 4)),
            LogSegmentMetadata::closed(1, Dlsn::new(1, 9)),
        ]);

        // when
        let segments = store.log_segments().await.unwrap();

        // then
        let seq_nos: Vec<u64> = segments.iter().map(|s| s.seg_seq_no).collect();
        assert_eq!(seq_nos, vec![1, 2]);
    }

    #[tokio::test]
    async fn should_notify_listener_on_update_and_delete() {
        // given
        let store = MemoryMetadataStore::new();
        let listener = RecordingListener::new();
        store.add_listener(listener.clone());

        // when
        store.update_segments(vec![LogSegmentMetadata::in_progress(1)]);
        store.delete_stream();

        // then
        assert_eq!(listener.updates.lock().unwrap().len(), 1);
        assert!(*listener.deleted.lock().unwrap());
    }
}
