//! Ordered execution of reader state mutations.
//!
//! Every state-mutating operation of the reader is enqueued here and runs on
//! a single worker task that owns the state, so mutations are FIFO and never
//! overlap. External callbacks (read completions, metadata pushes, idle
//! ticks) post work instead of mutating state themselves.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

type Task<S> = Box<dyn FnOnce(&mut S) -> ControlFlow<()> + Send>;

/// FIFO, non-overlapping executor over worker-owned state.
///
/// Once a close has been submitted, further submissions are dropped
/// silently; the close task itself is the last task the worker runs.
pub(crate) struct Serializer<S> {
    name: String,
    tx: mpsc::UnboundedSender<Task<S>>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Task<S>>>>>,
    closed: Arc<AtomicBool>,
}

impl<S> Clone for Serializer<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<S: Send + 'static> Serializer<S> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the worker that owns `state`. Subsequent calls are no-ops.
    pub(crate) fn start(&self, mut state: S) {
        let Some(mut rx) = self.rx.lock().expect("lock poisoned").take() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if let ControlFlow::Break(()) = task(&mut state) {
                    break;
                }
            }
        });
    }

    /// Submits a state mutation. Dropped silently once a close has been
    /// observed.
    pub(crate) fn submit(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let wrapped: Task<S> = Box::new(move |state| {
            task(state);
            ControlFlow::Continue(())
        });
        if self.tx.send(wrapped).is_err() {
            tracing::debug!("serializer for {} is shut down, dropping task", self.name);
        }
    }

    /// Submits the terminal close task; the worker stops after running it
    /// and everything submitted later is dropped. Returns whether the worker
    /// accepted the task.
    pub(crate) fn submit_close(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.closed.store(true, Ordering::Release);
        let wrapped: Task<S> = Box::new(move |state| {
            task(state);
            ControlFlow::Break(())
        });
        self.tx.send(wrapped).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn should_run_tasks_in_submission_order() {
        // given
        let (done_tx, mut done_rx) = unbounded_channel();
        let serializer: Serializer<Vec<u32>> = Serializer::new("test-stream");
        serializer.start(Vec::new());

        // when
        for i in 0..100u32 {
            serializer.submit(move |state| state.push(i));
        }
        let tx = done_tx.clone();
        serializer.submit(move |state| {
            let _ = tx.send(state.clone());
        });

        // then
        let state = done_rx.recv().await.unwrap();
        assert_eq!(state, (0..100).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn should_run_close_task_after_earlier_tasks() {
        // given
        let (done_tx, mut done_rx) = unbounded_channel();
        let serializer: Serializer<Vec<u32>> = Serializer::new("test-stream");
        serializer.start(Vec::new());
        serializer.submit(|state| state.push(1));
        serializer.submit(|state| state.push(2));

        // when
        let accepted = serializer.submit_close(move |state| {
            let _ = done_tx.send(state.clone());
        });

        // then: close observed every task scheduled before it, in order
        assert!(accepted);
        assert_eq!(done_rx.recv().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn should_drop_submissions_after_close() {
        // given
        let (done_tx, mut done_rx) = unbounded_channel();
        let serializer: Serializer<Vec<u32>> = Serializer::new("test-stream");
        serializer.start(Vec::new());
        serializer.submit_close(move |state| {
            let _ = done_tx.send(state.clone());
        });

        // when
        serializer.submit(|state| state.push(42));

        // then: the late submission never ran
        assert_eq!(done_rx.recv().await.unwrap(), Vec::<u32>::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(done_rx.try_recv().is_err());
    }
}
