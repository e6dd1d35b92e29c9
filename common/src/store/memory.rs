//! In-memory segment entry store.
//!
//! Backs tests and local development with the same semantics the reader sees
//! against a real segment store: ordered batches, LAC gating on the
//! in-progress tail, end-of-segment signalling on closed segments, and
//! caught-up notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{StoreError, StoreResult};
use crate::model::{Entry, EntryId, LogSegmentMetadata, SegmentSeqNo};
use crate::store::{EntryReaderListener, LogSegmentEntryReader, LogSegmentEntryStore};

/// An in-memory segment entry store.
///
/// Segments are created with [`add_segment`](MemoryEntryStore::add_segment),
/// filled with [`append`](MemoryEntryStore::append), made durable with
/// [`advance_lac`](MemoryEntryStore::advance_lac), and closed with
/// [`seal`](MemoryEntryStore::seal). Readers opened over a segment observe
/// these transitions: appends past the LAC are invisible until the LAC
/// advances, and sealing wakes readers waiting at the tail.
#[derive(Default)]
pub struct MemoryEntryStore {
    segments: Mutex<HashMap<SegmentSeqNo, Arc<MemorySegment>>>,
}

impl MemoryEntryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty in-progress segment. Idempotent.
    pub fn add_segment(&self, seg_seq_no: SegmentSeqNo) {
        let mut segments = self.segments.lock().expect("lock poisoned");
        segments
            .entry(seg_seq_no)
            .or_insert_with(|| Arc::new(MemorySegment::new(seg_seq_no)));
    }

    /// Appends an entry to a segment and returns its entry id.
    ///
    /// The entry is not readable until the LAC advances past it or the
    /// segment is sealed.
    pub fn append(&self, seg_seq_no: SegmentSeqNo, payload: Bytes) -> EntryId {
        let segment = self.segment(seg_seq_no);
        let entry_id = {
            let mut state = segment.state.lock().expect("lock poisoned");
            state.entries.push(payload);
            state.entries.len() as EntryId - 1
        };
        segment.changed.notify_waiters();
        entry_id
    }

    /// Advances the last add confirmed entry id of a segment.
    pub fn advance_lac(&self, seg_seq_no: SegmentSeqNo, lac: EntryId) {
        let segment = self.segment(seg_seq_no);
        {
            let mut state = segment.state.lock().expect("lock poisoned");
            if lac > state.lac {
                state.lac = lac;
            }
        }
        segment.changed.notify_waiters();
    }

    /// Seals a segment: every appended entry becomes durable and readers
    /// moving past the last entry observe end-of-segment.
    pub fn seal(&self, seg_seq_no: SegmentSeqNo) {
        let segment = self.segment(seg_seq_no);
        {
            let mut state = segment.state.lock().expect("lock poisoned");
            state.sealed = true;
            state.lac = state.entries.len() as EntryId - 1;
        }
        segment.changed.notify_waiters();
    }

    fn segment(&self, seg_seq_no: SegmentSeqNo) -> Arc<MemorySegment> {
        let mut segments = self.segments.lock().expect("lock poisoned");
        Arc::clone(
            segments
                .entry(seg_seq_no)
                .or_insert_with(|| Arc::new(MemorySegment::new(seg_seq_no))),
        )
    }

    fn lookup(&self, seg_seq_no: SegmentSeqNo) -> Option<Arc<MemorySegment>> {
        let segments = self.segments.lock().expect("lock poisoned");
        segments.get(&seg_seq_no).map(Arc::clone)
    }
}

#[async_trait]
impl LogSegmentEntryStore for MemoryEntryStore {
    async fn open_reader(
        &self,
        segment: LogSegmentMetadata,
        start_entry_id: EntryId,
    ) -> StoreResult<Arc<dyn LogSegmentEntryReader>> {
        let data = self
            .lookup(segment.seg_seq_no)
            .ok_or(StoreError::SegmentNotFound(segment.seg_seq_no))?;
        tracing::debug!(
            "opened reader over segment {} at entry {}",
            segment.seg_seq_no,
            start_entry_id
        );
        Ok(Arc::new(MemoryEntryReader {
            metadata: Mutex::new(segment),
            data,
            next_entry_id: Mutex::new(start_entry_id),
            started: AtomicBool::new(false),
            caught_up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }))
    }
}

struct MemorySegment {
    seg_seq_no: SegmentSeqNo,
    state: Mutex<MemorySegmentState>,
    changed: Notify,
}

impl MemorySegment {
    fn new(seg_seq_no: SegmentSeqNo) -> Self {
        Self {
            seg_seq_no,
            state: Mutex::new(MemorySegmentState {
                entries: Vec::new(),
                lac: -1,
                sealed: false,
            }),
            changed: Notify::new(),
        }
    }
}

struct MemorySegmentState {
    entries: Vec<Bytes>,
    lac: EntryId,
    sealed: bool,
}

struct MemoryEntryReader {
    metadata: Mutex<LogSegmentMetadata>,
    data: Arc<MemorySegment>,
    next_entry_id: Mutex<EntryId>,
    started: AtomicBool,
    caught_up: AtomicBool,
    closed: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn EntryReaderListener>>>,
}

enum ReadOutcome {
    Batch(Vec<Entry>, bool),
    EndOfSegment,
    Wait,
}

impl MemoryEntryReader {
    /// Returns the highest readable entry id: the segment end once sealed or
    /// closed, the LAC otherwise.
    fn readable_up_to(&self, state: &MemorySegmentState) -> EntryId {
        if self.is_sealed(state) {
            state.entries.len() as EntryId - 1
        } else {
            state.lac.min(state.entries.len() as EntryId - 1)
        }
    }

    fn is_sealed(&self, state: &MemorySegmentState) -> bool {
        state.sealed
            || !self
                .metadata
                .lock()
                .expect("lock poisoned")
                .is_in_progress()
    }

    fn try_read(&self, num_entries: usize) -> ReadOutcome {
        let state = self.data.state.lock().expect("lock poisoned");
        let mut next_entry_id = self.next_entry_id.lock().expect("lock poisoned");
        let readable_up_to = self.readable_up_to(&state);
        if *next_entry_id > readable_up_to {
            if self.is_sealed(&state) {
                return ReadOutcome::EndOfSegment;
            }
            return ReadOutcome::Wait;
        }
        let end = readable_up_to.min(*next_entry_id + num_entries as EntryId - 1);
        let batch = (*next_entry_id..=end)
            .map(|entry_id| Entry {
                seg_seq_no: self.data.seg_seq_no,
                entry_id,
                payload: state.entries[entry_id as usize].clone(),
            })
            .collect();
        *next_entry_id = end + 1;
        let at_tail = !self.is_sealed(&state) && *next_entry_id > state.lac;
        ReadOutcome::Batch(batch, at_tail)
    }

    fn mark_caught_up(&self) {
        if self.caught_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = self.listeners.lock().expect("lock poisoned").clone();
        for listener in listeners {
            listener.on_caught_up_on_inprogress();
        }
    }
}

#[async_trait]
impl LogSegmentEntryReader for MemoryEntryReader {
    fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            tracing::debug!("started reader over segment {}", self.data.seg_seq_no);
        }
    }

    async fn read_next(&self, num_entries: usize) -> StoreResult<Vec<Entry>> {
        loop {
            let changed = self.data.changed.notified();
            tokio::pin!(changed);
            // register for notify_waiters before inspecting state, so a
            // concurrent append/seal/close cannot slip between the check and
            // the wait
            changed.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return Err(StoreError::ReadCancelled(self.data.seg_seq_no));
            }
            match self.try_read(num_entries) {
                ReadOutcome::Batch(batch, at_tail) => {
                    if at_tail {
                        self.mark_caught_up();
                    }
                    return Ok(batch);
                }
                ReadOutcome::EndOfSegment => {
                    return Err(StoreError::EndOfLogSegment(self.data.seg_seq_no));
                }
                ReadOutcome::Wait => {
                    self.mark_caught_up();
                    changed.await;
                }
            }
        }
    }

    fn on_segment_metadata_updated(&self, segment: LogSegmentMetadata) {
        *self.metadata.lock().expect("lock poisoned") = segment;
        // wake a waiting read so it re-evaluates the segment status
        self.data.changed.notify_waiters();
    }

    fn register_listener(&self, listener: Arc<dyn EntryReaderListener>) {
        if self.caught_up.load(Ordering::Acquire) {
            listener.on_caught_up_on_inprogress();
        }
        self.listeners.lock().expect("lock poisoned").push(listener);
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.data.changed.notify_waiters();
        Ok(())
    }

    fn is_beyond_last_add_confirmed(&self) -> bool {
        let state = self.data.state.lock().expect("lock poisoned");
        let next_entry_id = *self.next_entry_id.lock().expect("lock poisoned");
        next_entry_id > self.readable_up_to(&state)
    }

    fn has_caught_up_on_inprogress(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    fn last_add_confirmed(&self) -> EntryId {
        self.data.state.lock().expect("lock poisoned").lac
    }

    fn segment(&self) -> LogSegmentMetadata {
        self.metadata.lock().expect("lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dlsn;
    use std::time::Duration;

    fn payload(entry_id: EntryId) -> Bytes {
        Bytes::from(format!("entry-{}", entry_id))
    }

    fn sealed_segment(store: &MemoryEntryStore, seg_seq_no: SegmentSeqNo, entries: usize) {
        store.add_segment(seg_seq_no);
        for entry_id in 0..entries {
            store.append(seg_seq_no, payload(entry_id as EntryId));
        }
        store.seal(seg_seq_no);
    }

    struct CountingListener {
        calls: Arc<Mutex<usize>>,
    }

    impl EntryReaderListener for CountingListener {
        fn on_caught_up_on_inprogress(&self) {
            *self.calls.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn should_read_batches_in_order_from_sealed_segment() {
        // given
        let store = MemoryEntryStore::new();
        sealed_segment(&store, 1, 5);
        let metadata = LogSegmentMetadata::closed(1, Dlsn::new(1, 4));

        // when
        let reader = store.open_reader(metadata, 0).await.unwrap();
        let first = reader.read_next(3).await.unwrap();
        let second = reader.read_next(3).await.unwrap();

        // then
        let ids: Vec<EntryId> = first.iter().chain(second.iter()).map(|e| e.entry_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(first[0].payload, payload(0));
    }

    #[tokio::test]
    async fn should_honor_start_entry_id() {
        // given
        let store = MemoryEntryStore::new();
        sealed_segment(&store, 1, 10);
        let metadata = LogSegmentMetadata::closed(1, Dlsn::new(1, 9));

        // when
        let reader = store.open_reader(metadata, 7).await.unwrap();
        let batch = reader.read_next(10).await.unwrap();

        // then
        let ids: Vec<EntryId> = batch.iter().map(|e| e.entry_id).collect();
        assert_eq!(ids, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn should_fail_with_end_of_segment_past_sealed_end() {
        // given
        let store = MemoryEntryStore::new();
        sealed_segment(&store, 1, 2);
        let metadata = LogSegmentMetadata::closed(1, Dlsn::new(1, 1));
        let reader = store.open_reader(metadata, 0).await.unwrap();
        reader.read_next(10).await.unwrap();

        // when
        let result = reader.read_next(10).await;

        // then
        assert_eq!(result, Err(StoreError::EndOfLogSegment(1)));
    }

    #[tokio::test]
    async fn should_fail_when_segment_unknown() {
        // given
        let store = MemoryEntryStore::new();

        // when
        let result = store
            .open_reader(LogSegmentMetadata::in_progress(9), 0)
            .await;

        // then
        assert!(matches!(result, Err(StoreError::SegmentNotFound(9))));
    }

    #[tokio::test]
    async fn should_gate_reads_on_lac() {
        // given: three entries appended but only entry 0 confirmed
        let store = MemoryEntryStore::new();
        store.add_segment(1);
        for entry_id in 0..3 {
            store.append(1, payload(entry_id));
        }
        store.advance_lac(1, 0);
        let reader = store
            .open_reader(LogSegmentMetadata::in_progress(1), 0)
            .await
            .unwrap();

        // when
        let batch = reader.read_next(10).await.unwrap();

        // then: only the confirmed prefix is readable
        assert_eq!(batch.len(), 1);
        assert!(reader.is_beyond_last_add_confirmed());
    }

    #[tokio::test]
    async fn should_complete_pending_read_when_lac_advances() {
        // given: a reader waiting at the tail of an in-progress segment
        let store = Arc::new(MemoryEntryStore::new());
        store.add_segment(1);
        store.append(1, payload(0));
        store.advance_lac(1, 0);
        let reader = store
            .open_reader(LogSegmentMetadata::in_progress(1), 0)
            .await
            .unwrap();
        reader.read_next(10).await.unwrap();

        let pending = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.read_next(10).await })
        };

        // when
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.append(1, payload(1));
        store.advance_lac(1, 1);

        // then
        let batch = pending.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entry_id, 1);
    }

    #[tokio::test]
    async fn should_notify_caught_up_listener_once() {
        // given
        let store = MemoryEntryStore::new();
        store.add_segment(1);
        store.append(1, payload(0));
        store.advance_lac(1, 0);
        let reader = store
            .open_reader(LogSegmentMetadata::in_progress(1), 0)
            .await
            .unwrap();
        let calls = Arc::new(Mutex::new(0));
        reader.register_listener(Arc::new(CountingListener {
            calls: Arc::clone(&calls),
        }));

        // when: consuming up to the LAC catches the reader up
        reader.read_next(10).await.unwrap();
        assert!(reader.has_caught_up_on_inprogress());

        // and: advancing and consuming again does not re-notify
        store.append(1, payload(1));
        store.advance_lac(1, 1);
        reader.read_next(10).await.unwrap();

        // then
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn should_notify_immediately_when_registered_after_catch_up() {
        // given: a reader that already caught up
        let store = MemoryEntryStore::new();
        store.add_segment(1);
        store.append(1, payload(0));
        store.advance_lac(1, 0);
        let reader = store
            .open_reader(LogSegmentMetadata::in_progress(1), 0)
            .await
            .unwrap();
        reader.read_next(10).await.unwrap();

        // when
        let calls = Arc::new(Mutex::new(0));
        reader.register_listener(Arc::new(CountingListener {
            calls: Arc::clone(&calls),
        }));

        // then
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn should_cancel_pending_read_on_close() {
        // given: a reader waiting at the tail
        let store = Arc::new(MemoryEntryStore::new());
        store.add_segment(1);
        let reader = store
            .open_reader(LogSegmentMetadata::in_progress(1), 0)
            .await
            .unwrap();
        let pending = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.read_next(10).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // when
        reader.close().await.unwrap();

        // then
        assert_eq!(pending.await.unwrap(), Err(StoreError::ReadCancelled(1)));
    }

    #[tokio::test]
    async fn should_release_pending_read_when_metadata_closes_segment() {
        // given: a reader caught up on the in-progress tail
        let store = Arc::new(MemoryEntryStore::new());
        store.add_segment(1);
        store.append(1, payload(0));
        store.advance_lac(1, 0);
        let reader = store
            .open_reader(LogSegmentMetadata::in_progress(1), 0)
            .await
            .unwrap();
        reader.read_next(10).await.unwrap();
        let pending = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.read_next(10).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // when: the segment is sealed and the reader learns about the close
        store.seal(1);
        reader.on_segment_metadata_updated(LogSegmentMetadata::closed(1, Dlsn::new(1, 0)));

        // then: nothing left past the end, so the read reports end of segment
        assert_eq!(pending.await.unwrap(), Err(StoreError::EndOfLogSegment(1)));
    }
}
