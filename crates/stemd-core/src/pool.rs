//! A bounded pool of worker threads with per-job cancellation.
//!
//! Jobs run FIFO on a fixed set of OS threads. Every enqueued job gets
//! its own cancellation state shared between the pool, the worker
//! executing it, and whoever holds the job's handle. Terminal states
//! are absorbing; a cancellation flag observed at the moment the
//! processor returns wins over both success and failure.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use crate::job::{JobDescriptor, JobEvent, JobId, JobStatus};

/// Invoked on a worker thread for each dequeued job. An error return
/// produces a `Failed` event unless cancellation was requested.
pub type JobProcessor =
    Box<dyn Fn(JobId, &JobDescriptor, &AtomicBool) -> std::result::Result<(), String> + Send + Sync>;

/// Receives every pool event. Must be thread-safe, must not block
/// worker progress, and must not call back into the pool: `Queued`
/// events fire while the pool lock is held.
pub type PoolCallback = Box<dyn Fn(&JobEvent) + Send + Sync>;

const DEFAULT_CANCEL_REASON: &str = "Job cancelled";
const SHUTDOWN_REASON: &str = "Worker pool shutting down";

/// Shared between the pool, the executing worker, and the handle.
struct CancellationState {
    requested: AtomicBool,
    reason: Mutex<String>,
}

impl CancellationState {
    fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            reason: Mutex::new(String::new()),
        }
    }

    /// Transition to requested; false if some earlier call already did.
    fn request(&self, reason: &str) -> bool {
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = if reason.is_empty() {
            DEFAULT_CANCEL_REASON.to_string()
        } else {
            reason.to_string()
        };
        true
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct QueuedJob {
    id: JobId,
    descriptor: JobDescriptor,
    cancellation: Arc<CancellationState>,
}

struct PoolState {
    queue: VecDeque<QueuedJob>,
    running: HashMap<JobId, Arc<CancellationState>>,
    next_id: JobId,
    shutting_down: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
    processor: JobProcessor,
    callback: Option<PoolCallback>,
}

impl PoolShared {
    fn emit(&self, event: JobEvent) {
        if let Some(callback) = &self.callback {
            callback(&event);
        }
    }

    fn emit_cancelled(&self, id: JobId, reason: String) {
        let mut event = JobEvent::status_only(id, JobStatus::Cancelled);
        event.error = Some(reason);
        self.emit(event);
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `thread_count` workers (clamped to at least one).
    pub fn new(thread_count: usize, processor: JobProcessor, callback: Option<PoolCallback>) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: HashMap::new(),
                next_id: 0,
                shutting_down: false,
            }),
            cv: Condvar::new(),
            processor,
            callback,
        });

        let count = thread_count.max(1);
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("stemd-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("Failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a job; `None` once the pool is shutting down. The
    /// `Queued` event fires synchronously before this returns.
    pub fn enqueue(&self, descriptor: JobDescriptor) -> Option<JobId> {
        let id;
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.shutting_down {
                return None;
            }
            id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(QueuedJob {
                id,
                descriptor,
                cancellation: Arc::new(CancellationState::new()),
            });

            // Emitted under the lock so a concurrent cancel of this id
            // cannot observe the queue entry before its Queued event.
            self.shared.emit(JobEvent::status_only(id, JobStatus::Queued));
        }
        self.shared.cv.notify_one();
        Some(id)
    }

    /// Request cancellation of a job. Returns true only when this call
    /// performed the not-requested → requested transition; unknown and
    /// already-terminal ids return false.
    pub fn cancel(&self, id: JobId, reason: &str) -> bool {
        let queued = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(pos) = state.queue.iter().position(|job| job.id == id) {
                match state.queue.remove(pos) {
                    Some(job) => {
                        job.cancellation.request(reason);
                        job
                    }
                    None => return false,
                }
            } else if let Some(cancellation) = state.running.get(&id) {
                // Transitioned under the lock: the worker decides its
                // terminal event with this same lock held, so a true
                // return here always yields a Cancelled event.
                return cancellation.request(reason);
            } else {
                return false;
            }
        };

        // Queue-time cancellation is emitted from the caller's context.
        self.shared
            .emit_cancelled(queued.id, queued.cancellation.reason());
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutting_down
    }

    /// Drain the queue, signal cancellation on running jobs, and join
    /// all workers. Pending jobs emit `Cancelled` with the shutdown
    /// reason. Idempotent.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;

            for cancellation in state.running.values() {
                cancellation.request(SHUTDOWN_REASON);
            }
            state.queue.drain(..).collect::<Vec<_>>()
        };
        self.shared.cv.notify_all();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.join();
        }

        for job in &drained {
            job.cancellation.request(SHUTDOWN_REASON);
            self.shared.emit_cancelled(job.id, job.cancellation.reason());
        }

        log::info!(
            "shutdown: worker pool stopped, {} pending jobs cancelled",
            drained.len()
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.running.insert(job.id, Arc::clone(&job.cancellation));
                    break job;
                }
                if state.shutting_down {
                    return;
                }
                state = shared
                    .cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        shared.emit(JobEvent::status_only(job.id, JobStatus::Running));

        let outcome = (shared.processor)(job.id, &job.descriptor, &job.cancellation.requested);

        // The flag is sampled under the pool lock, paired with the
        // locked transition in cancel(): a cancel that returned true is
        // always observed here.
        let cancelled = {
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.running.remove(&job.id);
            job.cancellation.requested.load(Ordering::SeqCst)
        };

        if cancelled {
            shared.emit_cancelled(job.id, job.cancellation.reason());
        } else {
            match outcome {
                Ok(()) => shared.emit(JobEvent::status_only(job.id, JobStatus::Completed)),
                Err(message) => {
                    let mut event = JobEvent::status_only(job.id, JobStatus::Failed);
                    event.error = Some(message);
                    shared.emit(event);
                }
            }
        }
    }
}
