//! In-memory registry mapping public job ids to handles and the last
//! observed event. Fed by the per-request observers the route layer
//! installs at submission time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use stemd_core::handle::JobHandle;
use stemd_core::job::{JobDescriptor, JobEvent, JobStatus};

/// Last known state of one submitted job.
#[derive(Clone)]
pub struct JobState {
    pub handle: JobHandle,
    pub last_event: JobEvent,
    pub output_dir: PathBuf,
    pub upload_path: PathBuf,
}

pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<String, JobState>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Public job ids are small decimal strings, independent of the
    /// pool's internal ids.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub fn add(&self, id: &str, handle: JobHandle, upload_path: PathBuf) {
        let last_event = JobEvent::status_only(handle.id(), JobStatus::Queued);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.to_string(),
                JobState {
                    handle,
                    last_event,
                    output_dir: PathBuf::new(),
                    upload_path,
                },
            );
    }

    /// Observer entry point: record the newest event and capture the
    /// output directory once the job completes.
    pub fn update(&self, id: &str, descriptor: &JobDescriptor, event: &JobEvent) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = jobs.get_mut(id) {
            state.last_event = event.clone();
            if event.status == JobStatus::Completed {
                state.output_dir = descriptor.output_dir.clone();
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<JobState> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
