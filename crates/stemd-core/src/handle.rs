//! Caller-facing job handles and the shared result slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::job::{JobDescriptor, JobEvent, JobId, JobObserver, JobResult};
use crate::pool::WorkerPool;

/// A write-once slot the runner fulfils with the terminal result. Any
/// number of waiters observe the same value; it resolves exactly once.
#[derive(Default)]
pub struct ResultSlot {
    value: Mutex<Option<JobResult>>,
    cv: Condvar,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// First fulfilment wins; later calls are ignored.
    pub(crate) fn fulfil(&self, result: JobResult) -> bool {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if value.is_some() {
            return false;
        }
        *value = Some(result);
        self.cv.notify_all();
        true
    }

    /// The result, if the job already reached a terminal state.
    pub fn try_get(&self) -> Option<JobResult> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the terminal result is available.
    pub fn wait(&self) -> JobResult {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = value.as_ref() {
                return result.clone();
            }
            value = self
                .cv
                .wait(value)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block up to `timeout`; `None` when the job is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobResult> {
        let value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let (value, _) = self
            .cv
            .wait_timeout_while(value, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        value.clone()
    }
}

/// State shared between the handle clones and the runner's context.
/// The runner reaches it through a weak reference so a dropped handle
/// never blocks terminal delivery.
pub(crate) struct JobHandleState {
    pub(crate) descriptor: JobDescriptor,
    pub(crate) id: JobId,
    pub(crate) result: Arc<ResultSlot>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) cancel_requested: AtomicBool,
    pub(crate) observer: Mutex<Option<JobObserver>>,
}

impl JobHandleState {
    /// Invoke the handle observer. The callback is cloned out under
    /// the lock so a concurrent replacement never observes a torn
    /// state and slow observers do not hold the lock.
    pub(crate) fn notify(&self, descriptor: &JobDescriptor, event: &JobEvent) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(descriptor, event);
        }
    }
}

/// A submitted job: result retrieval, cancellation, and an observer
/// slot. Dropping every clone does not cancel the job.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<JobHandleState>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.state.id).finish()
    }
}

impl JobHandle {
    pub(crate) fn new(state: Arc<JobHandleState>) -> Self {
        Self { state }
    }

    pub fn id(&self) -> JobId {
        self.state.id
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.state.descriptor
    }

    /// The shared terminal-result slot; valid as long as any clone of
    /// this handle (or the returned Arc) exists.
    pub fn result(&self) -> Arc<ResultSlot> {
        Arc::clone(&self.state.result)
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(&self) -> JobResult {
        self.state.result.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobResult> {
        self.state.result.wait_timeout(timeout)
    }

    pub fn try_result(&self) -> Option<JobResult> {
        self.state.result.try_get()
    }

    /// Request cancellation. Errors when this handle already requested
    /// it, or when the job is past the point of being cancellable.
    pub fn cancel(&self, reason: &str) -> Result<()> {
        if self
            .state
            .cancel_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::InvalidInput("Cancellation already requested".into()));
        }
        if !self.state.pool.cancel(self.state.id, reason) {
            return Err(Error::InvalidInput("Job is no longer cancellable".into()));
        }
        Ok(())
    }

    /// Install or replace the handle-scoped observer.
    pub fn set_observer(&self, observer: JobObserver) {
        *self
            .state
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use std::path::PathBuf;
    use std::thread;

    fn make_result(status: JobStatus) -> JobResult {
        JobResult {
            input_path: PathBuf::from("/music/first.wav"),
            output_dir: PathBuf::new(),
            status,
            error: None,
        }
    }

    #[test]
    fn test_slot_resolves_exactly_once() {
        let slot = ResultSlot::new();
        assert!(slot.try_get().is_none());

        assert!(slot.fulfil(make_result(JobStatus::Completed)));
        assert!(!slot.fulfil(make_result(JobStatus::Failed)));

        // Every observation sees the first value.
        assert_eq!(slot.try_get().unwrap().status, JobStatus::Completed);
        assert_eq!(slot.wait().status, JobStatus::Completed);
        assert_eq!(
            slot.wait_timeout(Duration::from_millis(10)).unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn test_wait_timeout_expires_when_unresolved() {
        let slot = ResultSlot::new();
        assert!(slot.wait_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_wait_wakes_blocked_threads() {
        let slot = Arc::new(ResultSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait().status)
        };

        thread::sleep(Duration::from_millis(10));
        slot.fulfil(make_result(JobStatus::Cancelled));
        assert_eq!(waiter.join().unwrap(), JobStatus::Cancelled);
    }
}
