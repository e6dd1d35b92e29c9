//! The read-ahead entry reader.
//!
//! Given a starting position, the reader prefetches entries from the segment
//! store into a bounded in-memory queue, crossing segment boundaries
//! transparently, absorbing segment metadata updates, pausing on
//! backpressure and resuming when the consumer drains the queue.
//!
//! All state changes run on one ordered task stream (the [`Serializer`]):
//! read completions, metadata pushes and idle ticks post serialized work
//! instead of mutating state themselves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use dlog_common::{
    Dlsn, Entry, EntryId, EntryReaderListener, LogSegmentEntryReader, LogSegmentEntryStore,
    LogSegmentListener, LogSegmentMetadata, LogSegmentMetadataStore, SegmentSeqNo, StoreError,
    StoreResult,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::EntryCache;
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::metrics::ReaderMetrics;
use crate::position::EntryPosition;
use crate::segment::SegmentReader;
use crate::serializer::Serializer;

/// Callback surface for read-ahead state changes.
pub trait ReaderStateListener: Send + Sync {
    /// A read-ahead operation completed; entries may be available.
    fn on_operation_complete(&self);

    /// The read-ahead hit a fatal error.
    fn on_error(&self, error: &Error);
}

/// One-way catching-up flag.
///
/// The reader starts catching up and flips to caught-up at most once, from
/// any of: the current in-progress reader reporting it reached the LAC when
/// a read is issued, an explicit caught-up notification from an inner
/// reader, or running out of segments to read.
pub(crate) struct CatchUpFlag {
    stream: String,
    catching_up: AtomicBool,
}

impl CatchUpFlag {
    pub(crate) fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            catching_up: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_catching_up(&self) -> bool {
        self.catching_up.load(Ordering::Acquire)
    }

    pub(crate) fn mark_caught_up(&self) {
        if self.catching_up.swap(false, Ordering::AcqRel) {
            tracing::info!("read ahead for {} is caught up", self.stream);
        }
    }

    fn set_caught_up(&self) {
        self.catching_up.store(false, Ordering::Release);
    }

    /// Evaluates the catch-up status against the inner reader about to be
    /// read from.
    pub(crate) fn check_before_read(&self, reader: &dyn LogSegmentEntryReader) {
        if reader.segment().is_in_progress()
            && self.is_catching_up()
            && reader.has_caught_up_on_inprogress()
        {
            tracing::info!(
                "read ahead for {} is caught up at entry {} @ log segment {}",
                self.stream,
                reader.last_add_confirmed(),
                reader.segment().seg_seq_no
            );
            self.set_caught_up();
        }
    }
}

impl EntryReaderListener for CatchUpFlag {
    fn on_caught_up_on_inprogress(&self) {
        self.mark_caught_up();
    }
}

/// State shared between the consumer-facing handle and the worker.
struct SharedState {
    stream: String,
    cache: EntryCache,
    last_error: OnceLock<Error>,
    catch_up: Arc<CatchUpFlag>,
    paused: AtomicBool,
    started: AtomicBool,
    next_position: EntryPosition,
    listeners: Mutex<Vec<Arc<dyn ReaderStateListener>>>,
}

impl SharedState {
    /// Records the first fatal error; later errors are dropped but still
    /// notified.
    fn set_last_error(&self, error: Error) {
        if self.last_error.set(error.clone()).is_err() {
            tracing::debug!(
                "last error of {} already set, dropping {}",
                self.stream,
                error
            );
        }
        self.notify_failure(&error);
    }

    fn notify_success(&self) {
        for listener in self.listener_snapshot() {
            listener.on_operation_complete();
        }
    }

    fn notify_failure(&self, error: &Error) {
        for listener in self.listener_snapshot() {
            listener.on_error(error);
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn ReaderStateListener>> {
        self.listeners.lock().expect("lock poisoned").clone()
    }
}

/// The read-ahead entry reader for one log stream.
///
/// Create it with [`new`](ReadAheadEntryReader::new), feed it the initial
/// segment list with [`start`](ReadAheadEntryReader::start), and consume
/// entries with [`next_entry`](ReadAheadEntryReader::next_entry). Segment
/// list changes are delivered through the [`LogSegmentListener`] impl.
///
/// All methods take `&self`; the reader is safe to share behind an `Arc`.
pub struct ReadAheadEntryReader {
    shared: Arc<SharedState>,
    serializer: Serializer<ReaderWorker>,
    close_state: Mutex<Option<watch::Receiver<Option<Result<()>>>>>,
    idle_stop: Option<CancellationToken>,
}

impl ReadAheadEntryReader {
    /// Creates a reader for `stream` positioned at `from_dlsn`.
    ///
    /// The reader stays passive until [`start`](ReadAheadEntryReader::start)
    /// delivers the initial segment list.
    pub fn new(
        stream: impl Into<String>,
        from_dlsn: Dlsn,
        config: ReaderConfig,
        entry_store: Arc<dyn LogSegmentEntryStore>,
        metadata_store: Arc<dyn LogSegmentMetadataStore>,
        metrics: Arc<ReaderMetrics>,
    ) -> Self {
        let stream = stream.into();
        let shared = Arc::new(SharedState {
            stream: stream.clone(),
            cache: EntryCache::new(config.read_ahead_max_records),
            last_error: OnceLock::new(),
            catch_up: Arc::new(CatchUpFlag::new(stream.clone())),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            next_position: EntryPosition::new(from_dlsn.seg_seq_no, from_dlsn.entry_id),
            listeners: Mutex::new(Vec::new()),
        });
        let serializer = Serializer::new(stream.clone());
        let worker = ReaderWorker {
            stream,
            config: config.clone(),
            from_dlsn,
            entry_store,
            metadata_store,
            shared: Arc::clone(&shared),
            serializer: serializer.clone(),
            metrics,
            current: None,
            next: None,
            queued: VecDeque::new(),
            closing: VecDeque::new(),
            current_seg_seq_no: 0,
            initialized: false,
            read_in_flight: false,
        };
        serializer.start(worker);
        let idle_stop = spawn_idle_check(
            config.idle_warn_threshold,
            Arc::clone(&shared),
            serializer.clone(),
        );
        Self {
            shared,
            serializer,
            close_state: Mutex::new(None),
            idle_stop,
        }
    }

    /// Starts reading with the given initial segment list.
    pub fn start(&self, segments: Vec<LogSegmentMetadata>) {
        tracing::info!(
            "starting the read ahead entry reader for {} : segments = {:?}",
            self.shared.stream,
            segments
        );
        self.shared.started.store(true, Ordering::Release);
        self.process_segments(segments);
    }

    /// Polls the next read-ahead entry, waiting up to `timeout` for one to
    /// become available.
    ///
    /// A sticky error is re-raised before the queue is polled; entries
    /// buffered before a failure are not drained.
    pub async fn next_entry(&self, timeout: Duration) -> Result<Option<Entry>> {
        if let Some(error) = self.shared.last_error.get() {
            return Err(error.clone());
        }
        let entry = self.shared.cache.pop_wait(timeout).await;
        // resume the read ahead once the cache drains below the threshold
        if entry.is_some() && !self.shared.cache.is_full() {
            self.invoke_read_ahead();
        }
        Ok(entry)
    }

    /// Returns the number of cached entries.
    pub fn num_cached_entries(&self) -> usize {
        self.shared.cache.len()
    }

    /// Returns whether the cache reached the pause threshold.
    pub fn is_cache_full(&self) -> bool {
        self.shared.cache.is_full()
    }

    /// Returns whether the cache is empty.
    pub fn is_cache_empty(&self) -> bool {
        self.shared.cache.is_empty()
    }

    /// Returns whether the read-ahead has produced nothing for longer than
    /// `threshold`.
    pub fn is_reader_idle(&self, threshold: Duration) -> bool {
        self.shared.cache.idle_for() > threshold
    }

    /// Returns whether the read-ahead has caught up with the tail of the
    /// log since it started. Never flips back once true.
    pub fn is_read_ahead_caught_up(&self) -> bool {
        !self.shared.catch_up.is_catching_up()
    }

    /// Returns the position of the next entry the read-ahead will deliver.
    pub fn next_entry_position(&self) -> Dlsn {
        self.shared.next_position.current()
    }

    /// Registers a state change listener.
    pub fn add_state_listener(&self, listener: Arc<dyn ReaderStateListener>) {
        self.shared
            .listeners
            .lock()
            .expect("lock poisoned")
            .push(listener);
    }

    /// Removes a previously registered state change listener.
    pub fn remove_state_listener(&self, listener: &Arc<dyn ReaderStateListener>) {
        self.shared
            .listeners
            .lock()
            .expect("lock poisoned")
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Closes the reader and all of its segment readers.
    ///
    /// Idempotent: the first caller performs the close, every caller
    /// observes the same completion. Serialized work scheduled before the
    /// close runs first; work submitted afterwards is dropped.
    pub async fn close(&self) -> Result<()> {
        let mut closed_rx = {
            let mut close_state = self.close_state.lock().expect("lock poisoned");
            let existing = close_state.clone();
            match existing {
                Some(closed_rx) => closed_rx,
                None => {
                    let (closed_tx, closed_rx) = watch::channel(None);
                    *close_state = Some(closed_rx.clone());
                    if let Some(idle_stop) = &self.idle_stop {
                        idle_stop.cancel();
                    }
                    if !self
                        .serializer
                        .submit_close(move |worker| worker.unsafe_close(closed_tx))
                    {
                        tracing::warn!(
                            "serializer of {} was already stopped before close",
                            self.shared.stream
                        );
                    }
                    closed_rx
                }
            }
        };
        let result = match closed_rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
            // the close task was dropped with the worker already stopped
            Err(_) => Ok(()),
        };
        result
    }

    fn process_segments(&self, segments: Vec<LogSegmentMetadata>) {
        self.serializer
            .submit(move |worker| worker.unsafe_process_segments(segments));
    }

    fn invoke_read_ahead(&self) {
        if self
            .shared
            .paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.serializer
                .submit(|worker| worker.unsafe_schedule_read_next());
        }
    }
}

impl LogSegmentListener for ReadAheadEntryReader {
    fn on_segments_updated(&self, segments: Vec<LogSegmentMetadata>) {
        if !self.shared.started.load(Ordering::Acquire) {
            return;
        }
        tracing::info!(
            "segment list of {} updated : {:?}",
            self.shared.stream,
            segments
        );
        self.process_segments(segments);
    }

    fn on_log_stream_deleted(&self) {
        self.shared.set_last_error(Error::LogNotFound(format!(
            "log stream {} is deleted",
            self.shared.stream
        )));
    }
}

/// Worker-owned reader state; every method here runs on the serializer.
struct ReaderWorker {
    stream: String,
    config: ReaderConfig,
    from_dlsn: Dlsn,
    entry_store: Arc<dyn LogSegmentEntryStore>,
    metadata_store: Arc<dyn LogSegmentMetadataStore>,
    shared: Arc<SharedState>,
    serializer: Serializer<ReaderWorker>,
    metrics: Arc<ReaderMetrics>,
    current: Option<SegmentReader>,
    next: Option<SegmentReader>,
    queued: VecDeque<SegmentReader>,
    closing: VecDeque<SegmentReader>,
    current_seg_seq_no: SegmentSeqNo,
    initialized: bool,
    read_in_flight: bool,
}

impl ReaderWorker {
    fn new_segment_reader(
        &self,
        metadata: LogSegmentMetadata,
        start_entry_id: EntryId,
    ) -> SegmentReader {
        SegmentReader::new(
            self.stream.clone(),
            metadata,
            start_entry_id,
            self.config.read_ahead_batch_size,
            Arc::clone(&self.entry_store),
            Arc::clone(&self.shared.catch_up),
        )
    }

    fn unsafe_process_segments(&mut self, segments: Vec<LogSegmentMetadata>) {
        if self.initialized {
            self.unsafe_reinitialize(segments);
        } else {
            self.unsafe_initialize(segments);
        }
    }

    /// Positions `current`/`next`/`queued` so that reading begins at the
    /// requested starting position.
    fn unsafe_initialize(&mut self, segments: Vec<LogSegmentMetadata>) {
        if segments.is_empty() {
            // wait for the first segment to be published
            return;
        }
        let mut skip_truncated = true;
        let mut dlsn_to_start = self.from_dlsn;
        let mut readers = VecDeque::new();
        for segment in segments {
            // skip segments before the requested position
            if segment.seg_seq_no < self.from_dlsn.seg_seq_no {
                continue;
            }
            if skip_truncated && !self.config.ignore_truncation_status && segment.is_truncated() {
                // a truncated head is fast-forwarded past, but a position
                // pointing strictly inside it is gone for good
                if dlsn_to_start.seg_seq_no == segment.seg_seq_no && dlsn_to_start.entry_id > 0 {
                    self.shared.set_last_error(Error::AlreadyTruncated(format!(
                        "{} : trying to position read ahead at {} on segment {} that is already marked as truncated",
                        self.stream, dlsn_to_start, segment.seg_seq_no
                    )));
                    return;
                }
                continue;
            }
            if skip_truncated
                && !self.config.ignore_truncation_status
                && segment.is_partially_truncated()
            {
                if let Some(min_active_dlsn) = segment.min_active_dlsn() {
                    if min_active_dlsn > self.from_dlsn {
                        dlsn_to_start = min_active_dlsn;
                    }
                }
            }
            skip_truncated = false;
            if !self.unsafe_is_allowed_to_position(&segment, dlsn_to_start) {
                tracing::error!(
                    "segment {} of {} is not allowed to position at {}",
                    segment.seg_seq_no,
                    self.stream,
                    dlsn_to_start
                );
                return;
            }
            let start_entry_id = if segment.seg_seq_no == dlsn_to_start.seg_seq_no {
                dlsn_to_start.entry_id
            } else {
                0
            };
            readers.push_back(self.new_segment_reader(segment, start_entry_id));
        }
        let Some(current) = readers.pop_front() else {
            // wait until a readable segment appears
            return;
        };
        current.open();
        current.start();
        self.current_seg_seq_no = current.seg_seq_no();
        self.current = Some(current.clone());
        self.unsafe_issue_read(current);
        for reader in &readers {
            reader.open();
        }
        self.queued = readers;
        self.unsafe_prefetch_next(true);
        self.initialized = true;
    }

    /// Reconciles a newly observed segment list against the readers the
    /// aggregate already holds.
    fn unsafe_reinitialize(&mut self, segments: Vec<LogSegmentMetadata>) {
        tracing::info!(
            "reinitializing segment readers of {} with {:?}",
            self.stream,
            segments
        );
        let mut segment_idx = 0;
        while segment_idx < segments.len()
            && segments[segment_idx].seg_seq_no < self.current_seg_seq_no
        {
            segment_idx += 1;
        }
        if segment_idx >= segments.len() {
            return;
        }
        // match against the current reader
        if let Some(current) = self.current.clone() {
            if !self.unsafe_update_segment_metadata(&current, &segments[segment_idx]) {
                return;
            }
        } else if self.current_seg_seq_no != segments[segment_idx].seg_seq_no {
            self.shared
                .set_last_error(Error::InconsistentMetadata(format!(
                    "inconsistent state in entry reader of {} : current segment sn = {}, new segment sn = {}",
                    self.stream, self.current_seg_seq_no, segments[segment_idx].seg_seq_no
                )));
            return;
        }
        segment_idx += 1;
        if segment_idx >= segments.len() {
            return;
        }
        // match against the prefetched next reader
        if let Some(next) = self.next.clone() {
            if !self.unsafe_update_segment_metadata(&next, &segments[segment_idx]) {
                return;
            }
            segment_idx += 1;
        }
        // match against the queued readers
        let mut reader_idx = 0;
        while reader_idx < self.queued.len() && segment_idx < segments.len() {
            let reader = self.queued[reader_idx].clone();
            if !self.unsafe_update_segment_metadata(&reader, &segments[segment_idx]) {
                return;
            }
            reader_idx += 1;
            segment_idx += 1;
        }
        // anything left over is new: queue a reader for it
        while segment_idx < segments.len() {
            let reader = self.new_segment_reader(segments[segment_idx].clone(), 0);
            reader.open();
            self.queued.push_back(reader);
            segment_idx += 1;
        }
        if self.current.is_none() {
            self.unsafe_move_to_next();
        }
        // resume the read ahead if it was paused waiting for segments
        self.unsafe_invoke_read_ahead();
    }

    /// Checks a metadata update against a reader and applies it.
    ///
    /// Only the in-progress to closed transition is propagated to the inner
    /// reader; a sequence mismatch or a closed to in-progress regression is
    /// a fatal inconsistency.
    fn unsafe_update_segment_metadata(
        &self,
        reader: &SegmentReader,
        new_metadata: &LogSegmentMetadata,
    ) -> bool {
        let old_metadata = reader.segment();
        if old_metadata.seg_seq_no != new_metadata.seg_seq_no {
            self.shared
                .set_last_error(Error::InconsistentMetadata(format!(
                    "inconsistent state in entry reader of {} : current segment = {}, new segment = {}",
                    self.stream, old_metadata.seg_seq_no, new_metadata.seg_seq_no
                )));
            return false;
        }
        if !old_metadata.is_in_progress() && new_metadata.is_in_progress() {
            self.shared
                .set_last_error(Error::InconsistentMetadata(format!(
                    "an in-progress segment {} received after closed segment {} on {}",
                    new_metadata.seg_seq_no, old_metadata.seg_seq_no, self.stream
                )));
            return false;
        }
        if old_metadata.is_in_progress() && !new_metadata.is_in_progress() {
            reader.update_segment_metadata(new_metadata.clone());
        }
        true
    }

    /// Checks whether the reader may be positioned at `position` within
    /// `segment`.
    fn unsafe_is_allowed_to_position(
        &self,
        segment: &LogSegmentMetadata,
        position: Dlsn,
    ) -> bool {
        if segment.is_truncated()
            && segment.last_dlsn.is_some_and(|last_dlsn| last_dlsn >= position)
            && !self.config.ignore_truncation_status
        {
            self.shared.set_last_error(Error::AlreadyTruncated(format!(
                "{} : trying to position read ahead at {} on segment {} that is already marked as truncated",
                self.stream, position, segment.seg_seq_no
            )));
            return false;
        }
        if segment.is_partially_truncated() {
            if let Some(min_active_dlsn) = segment.min_active_dlsn() {
                if min_active_dlsn > position {
                    if self.config.alert_when_positioning_on_truncated {
                        self.metrics.truncation_position_alerts_total.inc();
                        tracing::warn!(
                            "trying to position reader of {} at {} when segment {} is marked partially truncated",
                            self.stream,
                            position,
                            segment.seg_seq_no
                        );
                    }
                    if !self.config.ignore_truncation_status {
                        tracing::error!(
                            "{}: trying to position reader at {} when segment {} is marked partially truncated",
                            self.stream,
                            position,
                            segment.seg_seq_no
                        );
                        self.shared.set_last_error(Error::AlreadyTruncated(format!(
                            "{} : trying to position read ahead at {} on segment {} that is already marked as truncated",
                            self.stream, position, segment.seg_seq_no
                        )));
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Issues the outstanding read against `reader`. At most one read is in
    /// flight at a time.
    fn unsafe_issue_read(&mut self, reader: SegmentReader) {
        if self.read_in_flight {
            return;
        }
        self.read_in_flight = true;
        let serializer = self.serializer.clone();
        let seg_seq_no = reader.seg_seq_no();
        tokio::spawn(async move {
            let result = reader.read_next().await;
            serializer.submit(move |worker| worker.unsafe_complete_read(seg_seq_no, result));
        });
    }

    fn unsafe_complete_read(&mut self, seg_seq_no: SegmentSeqNo, result: StoreResult<Vec<Entry>>) {
        self.read_in_flight = false;
        match result {
            Ok(entries) => {
                self.metrics.batches_read_total.inc();
                self.metrics.entries_read_total.inc_by(entries.len() as u64);
                let last_position = entries
                    .last()
                    .map(|entry| (entry.seg_seq_no, entry.entry_id));
                self.shared.cache.push_batch(entries);
                if let Some((seg_seq_no, entry_id)) = last_position {
                    self.shared.next_position.advance(seg_seq_no, entry_id + 1);
                }
                self.shared.notify_success();
                if self.shared.cache.len() >= self.config.read_ahead_max_records {
                    self.unsafe_pause_on_cache_full();
                } else {
                    self.unsafe_schedule_read_next_task();
                }
            }
            Err(StoreError::EndOfLogSegment(_)) => {
                tracing::debug!(
                    "read ahead of {} reached the end of segment {}",
                    self.stream,
                    seg_seq_no
                );
                self.unsafe_move_to_next();
            }
            Err(err) => {
                self.shared.set_last_error(Error::from(err));
            }
        }
    }

    fn unsafe_schedule_read_next_task(&self) {
        self.serializer
            .submit(|worker| worker.unsafe_schedule_read_next());
    }

    fn unsafe_schedule_read_next(&mut self) {
        match self.current.clone() {
            Some(reader) => self.unsafe_issue_read(reader),
            None => self.unsafe_pause_on_no_more_segments(),
        }
    }

    fn unsafe_pause_on_cache_full(&mut self) {
        self.shared.paused.store(true, Ordering::Release);
        if !self.shared.cache.is_full() {
            // the consumer drained the cache between the size check and the
            // pause; resume immediately
            self.unsafe_invoke_read_ahead();
        }
    }

    fn unsafe_pause_on_no_more_segments(&mut self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    fn unsafe_invoke_read_ahead(&mut self) {
        if self
            .shared
            .paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.unsafe_schedule_read_next_task();
        }
    }

    /// Retires the current reader and promotes the next segment.
    fn unsafe_move_to_next(&mut self) {
        if let Some(current) = self.current.take() {
            tracing::debug!(
                "closing current segment reader {} of {}",
                current.seg_seq_no(),
                self.stream
            );
            self.closing.push_back(current.clone());
            let serializer = self.serializer.clone();
            tokio::spawn(async move {
                if let Err(err) = current.close().await {
                    tracing::warn!(
                        "failed to close reader of segment {}: {}",
                        current.seg_seq_no(),
                        err
                    );
                }
                serializer.submit(|worker| worker.unsafe_reap_closed_readers());
            });
        }
        if self.next.is_none() {
            self.unsafe_prefetch_next(false);
        }
        match self.next.take() {
            Some(next) => {
                tracing::debug!("{} moves to read segment {}", self.stream, next.seg_seq_no());
                self.current_seg_seq_no = next.seg_seq_no();
                self.current = Some(next.clone());
                self.unsafe_issue_read(next);
                self.unsafe_prefetch_next(true);
            }
            None => {
                // nothing left to read; wait for the next metadata update
                if self.shared.catch_up.is_catching_up() {
                    tracing::info!(
                        "read ahead for {} is caught up and has no segments to read",
                        self.stream
                    );
                    self.shared.catch_up.set_caught_up();
                }
                self.unsafe_pause_on_no_more_segments();
            }
        }
    }

    /// Promotes the head of the queue to `next`. With `only_in_progress`
    /// set, closed segments are left queued so their readers are attached
    /// only when actually needed.
    fn unsafe_prefetch_next(&mut self, only_in_progress: bool) {
        match self.queued.front() {
            Some(reader) if !only_in_progress || reader.segment().is_in_progress() => {}
            _ => return,
        }
        if let Some(reader) = self.queued.pop_front() {
            reader.start();
            self.next = Some(reader);
        }
    }

    fn unsafe_reap_closed_readers(&mut self) {
        while self.closing.front().is_some_and(SegmentReader::is_closed) {
            self.closing.pop_front();
        }
    }

    /// Idle tick handler: refreshes the segment list when the pipeline looks
    /// stuck.
    fn unsafe_check_idle(&mut self) {
        let stuck = self
            .current
            .as_ref()
            .map_or(true, SegmentReader::is_beyond_last_add_confirmed);
        if !stuck {
            return;
        }
        self.metrics.idle_refreshes_total.inc();
        tracing::debug!(
            "read ahead for {} has been idle, refreshing the segment list",
            self.stream
        );
        let metadata_store = Arc::clone(&self.metadata_store);
        let serializer = self.serializer.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            match metadata_store.log_segments().await {
                Ok(segments) => {
                    if shared.started.load(Ordering::Acquire) {
                        serializer.submit(move |worker| worker.unsafe_process_segments(segments));
                    }
                }
                Err(err) => {
                    // retried on the next idle check
                    tracing::debug!("idle segment list refresh failed: {}", err);
                }
            }
        });
    }

    /// Terminal close task: drains every reader into the closing queue and
    /// completes the close once all of them have closed.
    fn unsafe_close(&mut self, closed_tx: watch::Sender<Option<Result<()>>>) {
        let mut to_close: Vec<SegmentReader> = self.closing.drain(..).collect();
        if let Some(current) = self.current.take() {
            to_close.push(current);
        }
        if let Some(next) = self.next.take() {
            to_close.push(next);
        }
        to_close.extend(self.queued.drain(..));
        let stream = self.stream.clone();
        tokio::spawn(async move {
            let results = futures::future::join_all(
                to_close.iter().map(|reader| reader.close()),
            )
            .await;
            let mut outcome = Ok(());
            for result in results {
                if let Err(err) = result {
                    tracing::warn!("failed to close a segment reader of {}: {}", stream, err);
                    if outcome.is_ok() {
                        outcome = Err(Error::from(err));
                    }
                }
            }
            let _ = closed_tx.send(Some(outcome));
        });
    }
}

/// Spawns the periodic idle reader check, if enabled.
///
/// The check only forces a metadata refresh when the reader both has been
/// silent for longer than the threshold and looks stuck; a routinely idle
/// tail reader does not hammer the metadata source.
fn spawn_idle_check(
    threshold: Option<Duration>,
    shared: Arc<SharedState>,
    serializer: Serializer<ReaderWorker>,
) -> Option<CancellationToken> {
    let threshold = threshold?;
    if threshold.is_zero() {
        return None;
    }
    let stop = CancellationToken::new();
    let token = stop.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + threshold, threshold);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if shared.cache.idle_for() <= threshold {
                        continue;
                    }
                    serializer.submit(|worker| worker.unsafe_check_idle());
                }
            }
        }
        tracing::debug!("idle reader check of {} stopped", shared.stream);
    });
    Some(stop)
}
