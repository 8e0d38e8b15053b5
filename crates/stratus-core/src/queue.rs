//! Bounded worker pool with per-key ordering.
//!
//! Protocol-library callbacks run on a connection's read loop; calling
//! back into the same connection from there (writing a response,
//! re-entering the read path) deadlocks it. Every such callback defers
//! its work here instead.
//!
//! Two submission modes:
//!
//! - [`spawn`](TaskQueue::spawn) — run once on any worker, no ordering.
//! - [`spawn_for_key`](TaskQueue::spawn_for_key) — run once; all
//!   submissions sharing a key execute in submission order on the same
//!   worker, never overlapping. Keys are hashed onto one of N
//!   independent FIFO partitions, each drained by a dedicated worker, so
//!   per-key order costs no global lock.
//!
//! Submission is non-blocking and fails with [`QueueError`] when the
//! queue is shut down or saturated; callers own any cleanup for work
//! they failed to enqueue.

use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TaskQueueConfig;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task queue is shut down")]
    Closed,

    #[error("task queue is saturated")]
    Saturated,
}

/// Bounded pool of workers, each draining its own FIFO queue.
pub struct TaskQueue {
    senders: Vec<mpsc::Sender<Task>>,
    next: AtomicUsize,
    closed: AtomicBool,
    cancel: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(config: &TaskQueueConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.capacity.max(1);
        let cancel = CancellationToken::new();

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            handles.push(tokio::spawn(worker(index, rx, cancel.clone())));
        }

        Self {
            senders,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            cancel,
            handles: StdMutex::new(handles),
        }
    }

    /// Run `future` exactly once on some worker. No ordering guarantee
    /// relative to other submissions.
    pub fn spawn<F>(&self, future: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.submit(index, Box::pin(future))
    }

    /// Run `future` exactly once; submissions sharing `key` execute in
    /// submission order on the same worker and never concurrently.
    pub fn spawn_for_key<K, F>(&self, key: &K, future: F) -> Result<(), QueueError>
    where
        K: Hash + ?Sized,
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(self.partition(key), Box::pin(future))
    }

    /// Stop accepting submissions. Tasks already queued still run to
    /// completion before the workers exit.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Wait for all workers to finish. Call after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let handles = {
            let mut guard = self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn partition<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        usize::try_from(hasher.finish() % self.senders.len() as u64).unwrap_or(0)
    }

    fn submit(&self, index: usize, task: Task) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let sender = self.senders.get(index).ok_or(QueueError::Closed)?;
        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Saturated),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }
}

async fn worker(index: usize, mut rx: mpsc::Receiver<Task>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Drain tasks that were accepted before shutdown.
                while let Ok(task) = rx.try_recv() {
                    task.await;
                }
                break;
            }
            task = rx.recv() => match task {
                Some(task) => task.await,
                None => break,
            },
        }
    }
    tracing::trace!(worker = index, "task queue worker exiting");
}

// ── Tests ────────────────────────────────────────────────────────────
