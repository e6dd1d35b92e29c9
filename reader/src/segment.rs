//! Per-segment reader wrapper.
//!
//! [`SegmentReader`] wraps one inner entry reader from the segment store and
//! absorbs the asynchrony of opening it: starting, reading and metadata
//! updates requested before the open completes are chained onto it. An open
//! failure is absorbed and surfaces on the first read against the segment.

use std::sync::{Arc, Mutex};

use dlog_common::{
    Entry, EntryId, EntryReaderListener, LogSegmentEntryReader, LogSegmentEntryStore,
    LogSegmentMetadata, SegmentSeqNo, StoreError, StoreResult,
};
use tokio::sync::watch;

use crate::reader::CatchUpFlag;

/// Lifecycle of the wrapped entry reader.
enum OpenState {
    Unopened,
    Opening,
    Open(Arc<dyn LogSegmentEntryReader>),
    OpenFailed(StoreError),
}

struct SegmentReaderState {
    metadata: LogSegmentMetadata,
    open: OpenState,
    /// Metadata update received while the open was in flight.
    pending_metadata: Option<LogSegmentMetadata>,
    started: bool,
    close_started: bool,
    closed: bool,
}

struct SegmentReaderInner {
    stream: String,
    start_entry_id: EntryId,
    batch_size: usize,
    store: Arc<dyn LogSegmentEntryStore>,
    catch_up: Arc<CatchUpFlag>,
    state: Mutex<SegmentReaderState>,
    opened_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

/// A cheaply cloneable handle to one segment's reader state.
#[derive(Clone)]
pub(crate) struct SegmentReader {
    inner: Arc<SegmentReaderInner>,
}

impl SegmentReader {
    pub(crate) fn new(
        stream: String,
        metadata: LogSegmentMetadata,
        start_entry_id: EntryId,
        batch_size: usize,
        store: Arc<dyn LogSegmentEntryStore>,
        catch_up: Arc<CatchUpFlag>,
    ) -> Self {
        let (opened_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SegmentReaderInner {
                stream,
                start_entry_id,
                batch_size,
                store,
                catch_up,
                state: Mutex::new(SegmentReaderState {
                    metadata,
                    open: OpenState::Unopened,
                    pending_metadata: None,
                    started: false,
                    close_started: false,
                    closed: false,
                }),
                opened_tx,
                closed_tx,
            }),
        }
    }

    /// Returns the reader's view of the segment metadata.
    pub(crate) fn segment(&self) -> LogSegmentMetadata {
        self.inner.state.lock().expect("lock poisoned").metadata.clone()
    }

    pub(crate) fn seg_seq_no(&self) -> SegmentSeqNo {
        self.inner.state.lock().expect("lock poisoned").metadata.seg_seq_no
    }

    #[cfg(test)]
    pub(crate) fn start_entry_id(&self) -> EntryId {
        self.inner.start_entry_id
    }

    /// Requests an open from the entry store. Idempotent.
    pub(crate) fn open(&self) {
        {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if !matches!(state.open, OpenState::Unopened) {
                return;
            }
            state.open = OpenState::Opening;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let segment = inner.state.lock().expect("lock poisoned").metadata.clone();
            let result = inner.store.open_reader(segment, inner.start_entry_id).await;
            inner.install_opened(result);
        });
    }

    /// Starts the inner reader, or chains the start onto the open if it has
    /// not completed yet. Idempotent.
    pub(crate) fn start(&self) {
        let reader = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if state.started {
                return;
            }
            state.started = true;
            match &state.open {
                OpenState::Open(reader) => Some(Arc::clone(reader)),
                _ => None,
            }
        };
        if let Some(reader) = reader {
            reader.start();
        }
    }

    /// Reads the next batch.
    ///
    /// Waits for the open to complete first; an open failure surfaces here.
    /// The catch-up status is evaluated before the read is issued.
    pub(crate) async fn read_next(&self) -> StoreResult<Vec<Entry>> {
        let reader = self.opened().await?;
        self.inner.catch_up.check_before_read(reader.as_ref());
        reader.read_next(self.inner.batch_size).await
    }

    /// Applies updated segment metadata and informs the inner reader. If the
    /// open is still in flight the update is applied when it completes.
    pub(crate) fn update_segment_metadata(&self, segment: LogSegmentMetadata) {
        let reader = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            match &state.open {
                OpenState::Open(reader) => {
                    let reader = Arc::clone(reader);
                    state.metadata = segment.clone();
                    Some(reader)
                }
                OpenState::Unopened | OpenState::Opening => {
                    state.pending_metadata = Some(segment.clone());
                    None
                }
                // surfaced on the first read; nothing to inform
                OpenState::OpenFailed(_) => None,
            }
        };
        if let Some(reader) = reader {
            reader.on_segment_metadata_updated(segment);
        }
    }

    /// Closes the inner reader. The first caller performs the close; later
    /// callers wait for the same completion.
    pub(crate) async fn close(&self) -> StoreResult<()> {
        enum CloseAction {
            NeverOpened,
            AwaitFirst,
            CloseInner,
        }

        let action = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if state.close_started {
                CloseAction::AwaitFirst
            } else {
                state.close_started = true;
                if matches!(state.open, OpenState::Unopened) {
                    state.closed = true;
                    CloseAction::NeverOpened
                } else {
                    CloseAction::CloseInner
                }
            }
        };

        match action {
            CloseAction::NeverOpened => {
                self.inner.closed_tx.send_replace(true);
                Ok(())
            }
            CloseAction::AwaitFirst => {
                let mut closed_rx = self.inner.closed_tx.subscribe();
                let _ = closed_rx.wait_for(|closed| *closed).await;
                Ok(())
            }
            CloseAction::CloseInner => {
                let result = match self.opened().await {
                    Ok(reader) => reader.close().await,
                    // the open already failed, nothing to close
                    Err(_) => Ok(()),
                };
                self.inner.state.lock().expect("lock poisoned").closed = true;
                self.inner.closed_tx.send_replace(true);
                result
            }
        }
    }

    /// Returns whether the close has completed.
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("lock poisoned").closed
    }

    /// Returns whether the opened reader has no more readable entries at or
    /// below the LAC. False while the open is outstanding.
    pub(crate) fn is_beyond_last_add_confirmed(&self) -> bool {
        let state = self.inner.state.lock().expect("lock poisoned");
        match &state.open {
            OpenState::Open(reader) => reader.is_beyond_last_add_confirmed(),
            _ => false,
        }
    }

    async fn opened(&self) -> StoreResult<Arc<dyn LogSegmentEntryReader>> {
        {
            let state = self.inner.state.lock().expect("lock poisoned");
            match &state.open {
                OpenState::Open(reader) => return Ok(Arc::clone(reader)),
                OpenState::OpenFailed(err) => return Err(err.clone()),
                _ => {}
            }
        }
        let mut opened_rx = self.inner.opened_tx.subscribe();
        if opened_rx.wait_for(|opened| *opened).await.is_err() {
            return Err(StoreError::Storage(
                "segment reader dropped before open completed".to_string(),
            ));
        }
        let state = self.inner.state.lock().expect("lock poisoned");
        match &state.open {
            OpenState::Open(reader) => Ok(Arc::clone(reader)),
            OpenState::OpenFailed(err) => Err(err.clone()),
            _ => Err(StoreError::Storage(
                "segment reader open did not complete".to_string(),
            )),
        }
    }
}

impl SegmentReaderInner {
    fn install_opened(&self, result: StoreResult<Arc<dyn LogSegmentEntryReader>>) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            match result {
                Ok(reader) => {
                    if reader.segment().is_in_progress() {
                        reader.register_listener(
                            Arc::clone(&self.catch_up) as Arc<dyn EntryReaderListener>
                        );
                    }
                    if let Some(metadata) = state.pending_metadata.take() {
                        reader.on_segment_metadata_updated(metadata.clone());
                        state.metadata = metadata;
                    }
                    if state.started {
                        reader.start();
                    }
                    state.open = OpenState::Open(reader);
                }
                Err(err) => {
                    tracing::debug!(
                        "failed to open segment {} of {}: {}",
                        state.metadata.seg_seq_no,
                        self.stream,
                        err
                    );
                    state.open = OpenState::OpenFailed(err);
                }
            }
        }
        self.opened_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dlog_common::Dlsn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Entry store double that counts opens and can be told to fail them.
    struct CountingStore {
        opens: AtomicUsize,
        fail_open: bool,
        inner: Arc<FakeEntryReader>,
    }

    impl CountingStore {
        fn new(fail_open: bool) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                fail_open,
                inner: Arc::new(FakeEntryReader::default()),
            }
        }
    }

    #[async_trait]
    impl LogSegmentEntryStore for CountingStore {
        async fn open_reader(
            &self,
            segment: LogSegmentMetadata,
            _start_entry_id: EntryId,
        ) -> StoreResult<Arc<dyn LogSegmentEntryReader>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(StoreError::SegmentNotFound(segment.seg_seq_no));
            }
            *self.inner.metadata.lock().unwrap() = Some(segment);
            Ok(Arc::clone(&self.inner) as Arc<dyn LogSegmentEntryReader>)
        }
    }

    #[derive(Default)]
    struct FakeEntryReader {
        metadata: Mutex<Option<LogSegmentMetadata>>,
        starts: AtomicUsize,
        closes: AtomicUsize,
        metadata_updates: AtomicUsize,
    }

    #[async_trait]
    impl LogSegmentEntryReader for FakeEntryReader {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn read_next(&self, _num_entries: usize) -> StoreResult<Vec<Entry>> {
            Ok(Vec::new())
        }

        fn on_segment_metadata_updated(&self, segment: LogSegmentMetadata) {
            self.metadata_updates.fetch_add(1, Ordering::SeqCst);
            *self.metadata.lock().unwrap() = Some(segment);
        }

        fn register_listener(&self, _listener: Arc<dyn EntryReaderListener>) {}

        async fn close(&self) -> StoreResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_beyond_last_add_confirmed(&self) -> bool {
            false
        }

        fn has_caught_up_on_inprogress(&self) -> bool {
            false
        }

        fn last_add_confirmed(&self) -> EntryId {
            -1
        }

        fn segment(&self) -> LogSegmentMetadata {
            self.metadata
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| LogSegmentMetadata::in_progress(1))
        }
    }

    fn segment_reader(store: Arc<CountingStore>, metadata: LogSegmentMetadata) -> SegmentReader {
        SegmentReader::new(
            "test-stream".to_string(),
            metadata,
            0,
            4,
            store as Arc<dyn LogSegmentEntryStore>,
            Arc::new(CatchUpFlag::new("test-stream")),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn should_open_at_most_once() {
        // given
        let store = Arc::new(CountingStore::new(false));
        let reader = segment_reader(store.clone(), LogSegmentMetadata::in_progress(1));

        // when
        reader.open();
        reader.open();
        reader.open();
        settle().await;

        // then
        assert_eq!(store.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_chain_start_onto_pending_open() {
        // given
        let store = Arc::new(CountingStore::new(false));
        let reader = segment_reader(store.clone(), LogSegmentMetadata::in_progress(1));

        // when: start is requested before the open has completed
        reader.open();
        reader.start();
        reader.start();
        settle().await;

        // then: the inner reader was started exactly once
        assert_eq!(store.inner.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_surface_open_failure_on_first_read() {
        // given
        let store = Arc::new(CountingStore::new(true));
        let reader = segment_reader(store.clone(), LogSegmentMetadata::in_progress(7));

        // when
        reader.open();
        let result = reader.read_next().await;

        // then
        assert_eq!(result, Err(StoreError::SegmentNotFound(7)));
    }

    #[tokio::test]
    async fn should_defer_metadata_update_until_open_completes() {
        // given: an update arriving while the reader is unopened
        let store = Arc::new(CountingStore::new(false));
        let reader = segment_reader(store.clone(), LogSegmentMetadata::in_progress(1));
        let closed = LogSegmentMetadata::closed(1, Dlsn::new(1, 9));
        reader.update_segment_metadata(closed.clone());

        // when
        reader.open();
        settle().await;

        // then: the inner reader received the update and the view replaced
        assert_eq!(store.inner.metadata_updates.load(Ordering::SeqCst), 1);
        assert_eq!(reader.segment(), closed);
    }

    #[tokio::test]
    async fn should_close_immediately_when_never_opened() {
        // given
        let store = Arc::new(CountingStore::new(false));
        let reader = segment_reader(store.clone(), LogSegmentMetadata::in_progress(1));

        // when
        reader.close().await.unwrap();

        // then
        assert!(reader.is_closed());
        assert_eq!(store.inner.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_close_inner_reader_exactly_once() {
        // given
        let store = Arc::new(CountingStore::new(false));
        let reader = segment_reader(store.clone(), LogSegmentMetadata::in_progress(1));
        reader.open();
        settle().await;

        // when
        reader.close().await.unwrap();
        reader.close().await.unwrap();

        // then
        assert!(reader.is_closed());
        assert_eq!(store.inner.closes.load(Ordering::SeqCst), 1);
    }
}
