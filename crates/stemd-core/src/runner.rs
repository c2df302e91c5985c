//! The job runner: bridges the catalog, the worker pool, and the
//! separation engine.
//!
//! The runner correlates pool events with per-job contexts keyed by
//! normalized input path, fans events out to observers, and resolves
//! each job's shared result slot exactly once. Events that arrive
//! before the pool-assigned id is mapped to its path (the enqueue /
//! id-installation race) are buffered per id and replayed in arrival
//! order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::catalog::JobCatalog;
use crate::config::{JobOverrides, JobTemplate};
use crate::engine::SeparationEngine;
use crate::error::{Error, Result};
use crate::handle::{JobHandle, JobHandleState, ResultSlot};
use crate::job::{JobDescriptor, JobEvent, JobId, JobObserver, JobRequest, JobResult, JobStatus};
use crate::pool::WorkerPool;

/// Runner-owned state for one in-flight job.
struct JobContext {
    descriptor: JobDescriptor,
    result: Arc<ResultSlot>,
    output_dir: Mutex<Option<PathBuf>>,
    error: Mutex<Option<String>>,
    observer: Mutex<Option<JobObserver>>,
    handle: Mutex<Weak<JobHandleState>>,
}

struct RunnerState {
    catalog: JobCatalog,
    contexts: HashMap<PathBuf, Arc<JobContext>>,
    paths_by_id: HashMap<JobId, PathBuf>,
    pending_events: HashMap<JobId, Vec<JobEvent>>,
}

struct RunnerShared {
    state: Mutex<RunnerState>,
    engine: SeparationEngine,
    output_root: PathBuf,
    on_event: Option<JobObserver>,
}

pub struct JobRunner {
    shared: Arc<RunnerShared>,
    pool: Arc<WorkerPool>,
}

impl JobRunner {
    pub fn new(
        engine: SeparationEngine,
        output_root: PathBuf,
        defaults: JobTemplate,
        worker_count: usize,
        on_event: Option<JobObserver>,
    ) -> Self {
        Self::with_catalog(
            JobCatalog::new(defaults),
            engine,
            output_root,
            worker_count,
            on_event,
        )
    }

    /// Runner with an injected catalog (tests swap the existence
    /// check through here).
    pub fn with_catalog(
        catalog: JobCatalog,
        engine: SeparationEngine,
        output_root: PathBuf,
        worker_count: usize,
        on_event: Option<JobObserver>,
    ) -> Self {
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState {
                catalog,
                contexts: HashMap::new(),
                paths_by_id: HashMap::new(),
                pending_events: HashMap::new(),
            }),
            engine,
            output_root,
            on_event,
        });

        let processor_shared = Arc::clone(&shared);
        let callback_shared = Arc::clone(&shared);
        let pool = Arc::new(WorkerPool::new(
            worker_count,
            Box::new(move |id, descriptor, stop| {
                process_job(&processor_shared, id, descriptor, stop)
            }),
            Some(Box::new(move |event| handle_event(&callback_shared, event))),
        ));

        Self { shared, pool }
    }

    /// Admit, enqueue, and return a handle for one job.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        let overrides = JobOverrides {
            profile: request.profile,
            stems_filter: request.stems.clone(),
        };
        let mut output_base = self.shared.output_root.clone();
        if let Some(subdir) = &request.output_subdir {
            output_base = output_base.join(subdir);
        }

        let (descriptor, context) = {
            let mut state = self.lock_state();
            let descriptor = state.catalog.add(&request.input_path, &overrides, &output_base)?;
            let context = Arc::new(JobContext {
                descriptor: descriptor.clone(),
                result: Arc::new(ResultSlot::new()),
                output_dir: Mutex::new(None),
                error: Mutex::new(None),
                observer: Mutex::new(None),
                handle: Mutex::new(Weak::new()),
            });
            state
                .contexts
                .insert(descriptor.input_path.clone(), Arc::clone(&context));
            (descriptor, context)
        };

        // Queued (and possibly Running) events fired from here on are
        // buffered until the id mapping below is installed.
        let id = match self.pool.enqueue(descriptor.clone()) {
            Some(id) => id,
            None => {
                let mut state = self.lock_state();
                state.contexts.remove(&descriptor.input_path);
                state.catalog.release(&descriptor.input_path);
                return Err(Error::Shutdown("Worker pool is shut down".into()));
            }
        };

        let handle_state = Arc::new(JobHandleState {
            descriptor: descriptor.clone(),
            id,
            result: Arc::clone(&context.result),
            pool: Arc::clone(&self.pool),
            cancel_requested: AtomicBool::new(false),
            observer: Mutex::new(None),
        });

        {
            let mut state = self.lock_state();
            state.paths_by_id.insert(id, descriptor.input_path.clone());
            *context.observer.lock().unwrap_or_else(PoisonError::into_inner) =
                request.observer.clone();
            *context.handle.lock().unwrap_or_else(PoisonError::into_inner) =
                Arc::downgrade(&handle_state);
        }
        self.drain_pending(id);

        log::debug!(
            "submit: job {} admitted for {:?}",
            id,
            descriptor.input_path
        );
        Ok(JobHandle::new(handle_state))
    }

    /// Drain the pool; pending jobs are cancelled and their results
    /// resolved through the normal event path.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replay events buffered for `id` in arrival order. The buffer
    /// key stays in the map until the drain finds it empty, so events
    /// firing concurrently keep appending to it instead of taking the
    /// direct path and overtaking a replay still in flight.
    fn drain_pending(&self, id: JobId) {
        loop {
            let next = {
                let mut state = self.lock_state();
                match state.pending_events.get_mut(&id) {
                    Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                    _ => {
                        state.pending_events.remove(&id);
                        None
                    }
                }
            };
            match next {
                Some(event) => deliver_event(&self.shared, &event),
                None => break,
            }
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// Pool-facing event entry point. Buffers events whose id is not yet
/// mapped (or that have buffered predecessors) and delivers the rest.
fn handle_event(shared: &Arc<RunnerShared>, event: &JobEvent) {
    {
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let has_backlog = state.pending_events.contains_key(&event.id);
        if has_backlog || !state.paths_by_id.contains_key(&event.id) {
            state
                .pending_events
                .entry(event.id)
                .or_default()
                .push(event.clone());
            return;
        }
    }
    deliver_event(shared, event);
}

/// Deliver one event: bookkeeping under the runner lock, observer
/// fan-out outside it, and terminal result resolution.
fn deliver_event(shared: &Arc<RunnerShared>, event: &JobEvent) {
    let terminal = event.status.is_terminal();

    let (context, input_path) = {
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(path) = state.paths_by_id.get(&event.id).cloned() else {
            // Terminal already delivered for this id; later events are
            // absorbed.
            return;
        };
        let context = state.contexts.get(&path).cloned();
        if terminal {
            state.paths_by_id.remove(&event.id);
            state.contexts.remove(&path);
            state.catalog.release(&path);
        }
        (context, path)
    };

    let Some(context) = context else {
        return;
    };

    notify_observers(shared, &context, event);

    if terminal {
        let output_dir = if event.status == JobStatus::Completed {
            context
                .output_dir
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default()
        } else {
            PathBuf::new()
        };
        let error = if event.status == JobStatus::Completed {
            None
        } else {
            context
                .error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .or_else(|| event.error.clone())
        };

        context.result.fulfil(JobResult {
            input_path,
            output_dir,
            status: event.status,
            error,
        });
    }
}

/// Fan out in the fixed order: global observer, per-request observer,
/// handle observer. Observer panics are caught and discarded so a
/// misbehaving callback cannot sink the event stream.
fn notify_observers(shared: &Arc<RunnerShared>, context: &Arc<JobContext>, event: &JobEvent) {
    let descriptor = &context.descriptor;

    if let Some(global) = &shared.on_event {
        if catch_unwind(AssertUnwindSafe(|| global(descriptor, event))).is_err() {
            log::warn!("notify_observers: global observer panicked, event dropped for it");
        }
    }

    let observer = context
        .observer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(observer) = observer {
        if catch_unwind(AssertUnwindSafe(|| observer(descriptor, event))).is_err() {
            log::warn!("notify_observers: request observer panicked, event dropped for it");
        }
    }

    let handle = context
        .handle
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(handle) = handle.upgrade() {
        if catch_unwind(AssertUnwindSafe(|| handle.notify(descriptor, event))).is_err() {
            log::warn!("notify_observers: handle observer panicked, event dropped for it");
        }
    }
}

/// Executed on a worker thread for each dequeued job.
fn process_job(
    shared: &Arc<RunnerShared>,
    id: JobId,
    descriptor: &JobDescriptor,
    stop: &AtomicBool,
) -> std::result::Result<(), String> {
    if stop.load(Ordering::SeqCst) {
        // Cancelled before it started; the pool emits the terminal.
        return Ok(());
    }

    let progress_shared = Arc::clone(shared);
    let progress = move |fraction: f32, message: &str| {
        let event = JobEvent {
            id,
            status: JobStatus::Running,
            progress: fraction,
            message: message.to_string(),
            error: None,
        };
        handle_event(&progress_shared, &event);
    };

    let outcome = shared.engine.process(descriptor, stop, &progress);

    let context = {
        let state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.contexts.get(&descriptor.input_path).cloned()
    };

    match outcome {
        Ok(output_dir) => {
            if let Some(context) = context {
                *context
                    .output_dir
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(output_dir);
            }
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            // When the stop flag is set the terminal will be Cancelled
            // and should carry the cancellation reason, not the
            // engine's abort message.
            if !stop.load(Ordering::SeqCst) {
                if let Some(context) = context {
                    *context.error.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(message.clone());
                }
            }
            Err(message)
        }
    }
}
