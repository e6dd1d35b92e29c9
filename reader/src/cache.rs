//! The entry queue between the read-ahead producer and the consumer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use dlog_common::Entry;
use tokio::sync::Notify;
use tokio::time::Instant;

/// FIFO entry queue between the read-ahead loop and the consumer.
///
/// The queue itself is unbounded; backpressure is cooperative. The producer
/// pauses once the queue reaches `max_cached` and may overshoot by at most
/// one batch. The queue also tracks the last time the producer delivered a
/// batch, which drives idle detection.
pub(crate) struct EntryCache {
    queue: Mutex<VecDeque<Entry>>,
    available: Notify,
    max_cached: usize,
    last_added: Mutex<Instant>,
}

impl EntryCache {
    pub(crate) fn new(max_cached: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            max_cached,
            last_added: Mutex::new(Instant::now()),
        }
    }

    /// Enqueues a batch in order and records producer activity. Activity is
    /// recorded even for an empty batch.
    pub(crate) fn push_batch(&self, entries: Vec<Entry>) {
        *self.last_added.lock().expect("lock poisoned") = Instant::now();
        if entries.is_empty() {
            return;
        }
        self.queue.lock().expect("lock poisoned").extend(entries);
        self.available.notify_one();
    }

    /// Takes the next entry, waiting up to `timeout` for one to arrive.
    pub(crate) async fn pop_wait(&self, timeout: Duration) -> Option<Entry> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.take_one() {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                // one final attempt in case an entry raced the deadline
                return self.take_one();
            }
        }
    }

    fn take_one(&self) -> Option<Entry> {
        let mut queue = self.queue.lock().expect("lock poisoned");
        let entry = queue.pop_front();
        if entry.is_some() && !queue.is_empty() {
            // hand the wakeup on to the next waiter
            self.available.notify_one();
        }
        entry
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().expect("lock poisoned").len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().expect("lock poisoned").is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.max_cached
    }

    /// Time since the producer last delivered a batch.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_added.lock().expect("lock poisoned").elapsed()
    }
}
