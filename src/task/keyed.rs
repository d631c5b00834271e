//! Bounded worker pool that routes work to a shard by key hash so work with
//! the same key runs serially.
//!
//! Each worker owns one bounded queue; a full queue is backpressure, not an
//! error to retry in a tight loop. Callers get a [`TaskHandle`] to observe
//! completion without holding any reference to the job itself.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;

use crate::Transience;
use crate::core::now_ms;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The target queue is full; the caller should log and move on.
    #[error("executor {name} busy, queue full for shard {shard}")]
    Busy { name: String, shard: usize },

    #[error("executor {name} is shut down")]
    Shutdown { name: String },
}

impl ExecutorError {
    pub fn transience(&self) -> Transience {
        match self {
            ExecutorError::Busy { .. } => Transience::Retryable,
            ExecutorError::Shutdown { .. } => Transience::Permanent,
        }
    }
}

const STATUS_PENDING: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_SUCCESS: u8 = 2;
const STATUS_FAILED: u8 = 3;

struct TaskState {
    create_ms: u64,
    start_ms: AtomicU64,
    end_ms: AtomicU64,
    status: AtomicU8,
}

/// Observation handle for a submitted job.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(TaskState {
                create_ms: now_ms(),
                start_ms: AtomicU64::new(0),
                end_ms: AtomicU64::new(0),
                status: AtomicU8::new(STATUS_PENDING),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state.status.load(Ordering::Acquire),
            STATUS_SUCCESS | STATUS_FAILED
        )
    }

    pub fn is_success(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == STATUS_SUCCESS
    }

    pub fn is_failed(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == STATUS_FAILED
    }

    pub fn create_ms(&self) -> u64 {
        self.state.create_ms
    }

    pub fn start_ms(&self) -> u64 {
        self.state.start_ms.load(Ordering::Acquire)
    }

    pub fn end_ms(&self) -> u64 {
        self.state.end_ms.load(Ordering::Acquire)
    }

    /// Finished, and created at least `millis` ago. The scheduling loops use
    /// this to decide when a periodic task is due again.
    pub fn is_over_after(&self, millis: u64) -> bool {
        self.is_finished() && now_ms().saturating_sub(self.state.create_ms) >= millis
    }

    fn mark_running(&self) {
        self.state.start_ms.store(now_ms(), Ordering::Release);
        self.state.status.store(STATUS_RUNNING, Ordering::Release);
    }

    fn mark_done(&self, success: bool) {
        self.state.end_ms.store(now_ms(), Ordering::Release);
        let status = if success { STATUS_SUCCESS } else { STATUS_FAILED };
        self.state.status.store(status, Ordering::Release);
    }
}

type Job = Box<dyn FnOnce() -> bool + Send>;

pub struct KeyedExecutor {
    name: String,
    senders: Vec<Sender<(TaskHandle, Job)>>,
    workers: Vec<JoinHandle<()>>,
}

impl KeyedExecutor {
    pub fn new(name: &str, threads: usize, queue_size: usize) -> Self {
        let threads = threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let (tx, rx) = bounded(queue_size.max(1));
            senders.push(tx);
            workers.push(spawn_worker(name, i, rx));
        }
        Self {
            name: name.to_string(),
            senders,
            workers,
        }
    }

    /// Submit a job routed by `key`; jobs sharing a shard run serially in
    /// submission order. The job returns whether it succeeded.
    pub fn execute<K: Hash>(
        &self,
        key: K,
        job: impl FnOnce() -> bool + Send + 'static,
    ) -> Result<TaskHandle, ExecutorError> {
        let shard = shard_of(&key, self.senders.len());
        let handle = TaskHandle::new();
        match self.senders[shard].try_send((handle.clone(), Box::new(job))) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(_)) => Err(ExecutorError::Busy {
                name: self.name.clone(),
                shard,
            }),
            Err(TrySendError::Disconnected(_)) => Err(ExecutorError::Shutdown {
                name: self.name.clone(),
            }),
        }
    }

    /// Drop the queues and wait for workers to drain and exit.
    pub fn shutdown(mut self) {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for KeyedExecutor {
    fn drop(&mut self) {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn spawn_worker(name: &str, index: usize, rx: Receiver<(TaskHandle, Job)>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("{name}-{index}"))
        .spawn(move || {
            for (handle, job) in rx {
                handle.mark_running();
                let success = job();
                handle.mark_done(success);
            }
        })
        .expect("spawn executor worker")
}

fn shard_of<K: Hash>(key: &K, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
