//! The job catalog: admission, normalization, and dedup of inputs.
//!
//! At most one in-flight job exists per source file; the runner
//! releases the path once the job reaches a terminal state so the same
//! file can be re-submitted afterwards.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::config::{JobOverrides, JobTemplate};
use crate::error::{Error, Result};
use crate::job::JobDescriptor;

/// Existence probe, injectable for tests.
pub type ExistsCheck = Box<dyn Fn(&Path) -> bool + Send>;

/// Not thread-safe by itself; the runner serializes access under its
/// own lock.
pub struct JobCatalog {
    base_config: JobTemplate,
    exists: ExistsCheck,
    seen_paths: HashSet<PathBuf>,
}

impl JobCatalog {
    pub fn new(base_config: JobTemplate) -> Self {
        Self::with_exists_check(base_config, Box::new(|path| path.exists()))
    }

    pub fn with_exists_check(base_config: JobTemplate, exists: ExistsCheck) -> Self {
        Self {
            base_config,
            exists,
            seen_paths: HashSet::new(),
        }
    }

    /// Admit a path, producing the immutable descriptor for the job.
    /// The descriptor's output directory is `output_base` joined with
    /// the input's file stem.
    pub fn add(
        &mut self,
        path: &Path,
        overrides: &JobOverrides,
        output_base: &Path,
    ) -> Result<JobDescriptor> {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("Input path must not be empty".into()));
        }

        let normalized = normalize_path(path);

        if !(self.exists)(&normalized) {
            return Err(Error::NotFound(normalized));
        }

        if self.seen_paths.contains(&normalized) {
            return Err(Error::InvalidInput(format!(
                "Input path already enqueued: {}",
                normalized.display()
            )));
        }

        let config = self.apply_overrides(overrides)?;

        let stem = normalized
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| normalized.as_os_str().to_os_string());
        let output_dir = output_base.join(stem);

        self.seen_paths.insert(normalized.clone());
        Ok(JobDescriptor {
            input_path: normalized,
            config,
            output_dir,
        })
    }

    /// Forget a previously admitted path so it can be submitted again.
    pub fn release(&mut self, path: &Path) {
        self.seen_paths.remove(&normalize_path(path));
    }

    fn apply_overrides(&self, overrides: &JobOverrides) -> Result<JobTemplate> {
        let mut config = self.base_config.clone();

        if let Some(profile) = overrides.profile {
            config.profile = profile;
        }

        if let Some(stems) = &overrides.stems_filter {
            for stem in stems {
                if !config.profile.supports_stem(stem) {
                    return Err(Error::InvalidInput(format!(
                        "Unsupported stem override: {}",
                        stem
                    )));
                }
            }
            config.stems_filter = stems.clone();
        }

        Ok(config)
    }
}

/// Lexically normalize a path: drop `.` components and resolve `..`
/// against preceding normal components, without touching the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}
