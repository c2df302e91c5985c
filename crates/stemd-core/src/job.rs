//! Job lifecycle types shared between the worker pool, the runner,
//! and callers.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::JobTemplate;
use crate::profile::ModelProfile;

/// Pool-assigned job identifier, unique per process lifetime.
pub type JobId = u64;

/// Lifecycle states of a job. `Completed`, `Failed` and `Cancelled`
/// are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle or progress notification for one job.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,

    /// Fraction in `[0, 1]`; negative means a status-only update.
    pub progress: f32,

    pub message: String,
    pub error: Option<String>,
}

impl JobEvent {
    /// An event with no progress payload.
    pub fn status_only(id: JobId, status: JobStatus) -> Self {
        Self {
            id,
            status,
            progress: -1.0,
            message: String::new(),
            error: None,
        }
    }

    pub fn has_progress(&self) -> bool {
        self.progress >= 0.0
    }
}

/// The immutable unit of work admitted by the catalog.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Lexically normalized input path
    pub input_path: PathBuf,
    pub config: JobTemplate,
    pub output_dir: PathBuf,
}

/// Observer invoked with every event delivered for a job. Shared so a
/// replacement can be swapped in while an invocation is in flight.
pub type JobObserver = Arc<dyn Fn(&JobDescriptor, &JobEvent) + Send + Sync>;

/// A submission request.
#[derive(Default)]
pub struct JobRequest {
    pub input_path: PathBuf,
    pub profile: Option<ModelProfile>,
    pub stems: Option<Vec<String>>,
    pub output_subdir: Option<PathBuf>,
    pub observer: Option<JobObserver>,
}

impl JobRequest {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            ..Self::default()
        }
    }
}

/// Terminal outcome delivered through the handle's result slot.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub input_path: PathBuf,

    /// Empty unless the job completed
    pub output_dir: PathBuf,

    pub status: JobStatus,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_only_event_has_no_progress() {
        let event = JobEvent::status_only(7, JobStatus::Running);
        assert!(!event.has_progress());
        assert_eq!(event.id, 7);
    }
}
