//! Service facade: construction, submission, and model management.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crate::cache::{ModelCache, ModelHandle, WeightProgress};
use crate::config::JobTemplate;
use crate::engine::SeparationEngine;
use crate::error::{Error, Result};
use crate::fetcher::{HttpWeightFetcher, WeightFetcher};
use crate::handle::JobHandle;
use crate::job::{JobObserver, JobRequest};
use crate::manifest::Manifest;
use crate::profile::ModelProfile;
use crate::runner::JobRunner;
use crate::session::{DemucsBackend, InferenceBackend, ModelSession};
use crate::session_pool::SessionPool;

/// Cache-side options.
#[derive(Default)]
pub struct CacheConfig {
    /// Where weight blobs live on disk. Required.
    pub root: PathBuf,

    /// HTTP fetcher by default.
    pub fetcher: Option<Arc<dyn WeightFetcher>>,

    /// Called from the fetcher's thread with download progress.
    pub on_progress: Option<WeightProgress>,

    /// Explicit manifest file; the embedded default otherwise.
    pub manifest_path: Option<PathBuf>,
}

/// Everything needed to bring the service up.
#[derive(Default)]
pub struct RuntimeConfig {
    pub cache: CacheConfig,

    /// Where job output directories are created. Required.
    pub output_root: PathBuf,

    /// Defaults to the machine's available parallelism, at least one.
    pub worker_count: Option<usize>,

    /// Global observer receiving every job's events.
    pub on_job_event: Option<JobObserver>,

    /// Inference backend; the native demucs backend by default.
    pub backend: Option<Arc<dyn InferenceBackend>>,
}

/// High-level entry point for submitting separation jobs and managing
/// model weights.
pub struct Service {
    cache: Arc<ModelCache>,
    runner: JobRunner,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

impl Service {
    pub fn create(runtime: RuntimeConfig, defaults: JobTemplate) -> Result<Self> {
        if runtime.cache.root.as_os_str().is_empty() {
            return Err(Error::Config("Cache root must not be empty".into()));
        }
        if runtime.output_root.as_os_str().is_empty() {
            return Err(Error::Config("Output root must not be empty".into()));
        }

        fs::create_dir_all(&runtime.cache.root).map_err(|e| {
            Error::Config(format!(
                "Failed to create cache root {:?}: {}",
                runtime.cache.root, e
            ))
        })?;
        fs::create_dir_all(&runtime.output_root).map_err(|e| {
            Error::Config(format!(
                "Failed to create output root {:?}: {}",
                runtime.output_root, e
            ))
        })?;

        let fetcher = runtime
            .cache
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpWeightFetcher::new()));
        let manifest = match &runtime.cache.manifest_path {
            Some(path) => Manifest::from_file(path)?,
            None => Manifest::load_default()?,
        };
        let cache = Arc::new(ModelCache::new(
            runtime.cache.root.clone(),
            fetcher,
            manifest,
            runtime.cache.on_progress.clone(),
        ));

        let backend = runtime
            .backend
            .unwrap_or_else(|| Arc::new(DemucsBackend::new()));
        if !backend.is_available() {
            log::warn!(
                "create: inference backend '{}' is unavailable: {}",
                backend.name(),
                backend.unavailable_reason().unwrap_or("no reason given")
            );
        }

        let factory_cache = Arc::clone(&cache);
        let sessions = SessionPool::new(Box::new(move |profile| {
            let resolver_cache = Arc::clone(&factory_cache);
            Ok(ModelSession::new(
                profile,
                Box::new(move || {
                    resolver_cache
                        .ensure_ready(profile)
                        .map(|handle| handle.weights_path)
                }),
                Arc::clone(&backend),
            ))
        }));
        let engine = SeparationEngine::new(sessions);

        let worker_count = runtime
            .worker_count
            .unwrap_or_else(default_worker_count)
            .max(1);
        let runner = JobRunner::new(
            engine,
            runtime.output_root.clone(),
            defaults,
            worker_count,
            runtime.on_job_event.clone(),
        );

        log::info!(
            "create: service ready with {} workers, cache at {:?}, output at {:?}",
            worker_count,
            runtime.cache.root,
            runtime.output_root
        );
        Ok(Self { cache, runner })
    }

    /// Submit one separation job.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        if request.input_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("Input path must not be empty".into()));
        }
        self.runner.submit(request)
    }

    /// Make sure a profile's weights are cached and verified.
    pub fn ensure_model_ready(&self, profile: ModelProfile) -> Result<ModelHandle> {
        self.cache.ensure_ready(profile)
    }

    /// Drop cached weights for one profile, or all of them.
    pub fn purge_models(&self, profile: Option<ModelProfile>) -> Result<()> {
        match profile {
            Some(profile) => self.cache.purge(profile),
            None => self.cache.purge_all(),
        }
    }

    /// Drain the worker pool. Also runs when the service is dropped.
    pub fn shutdown(&self) {
        self.runner.shutdown();
    }
}

fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::manifest::ManifestEntry;
    use crate::testutil::{scratch_dir, FakeFetcher, StubBackend};
    use std::fs;

    const PAYLOAD: &str = "fake-weights";
    const PAYLOAD_SHA: &str = "bf6875a563be64dafa0c8e16f4b6093f55e15ba38f5c7a8844eaa61141dc805e";

    fn write_manifest(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("manifest.json");
        let json = format!(
            r#"{{
                "source": {{ "url_template": "http://example.invalid/{{filename}}" }},
                "models": [
                    {{ "profile": "balanced-four-stem",
                       "filename": "ggml-model-htdemucs-4s-f16.bin",
                       "size_bytes": {len},
                       "sha256": "{sha}" }},
                    {{ "profile": "balanced-six-stem",
                       "filename": "ggml-model-htdemucs-6s-f16.bin",
                       "size_bytes": {len},
                       "sha256": "{sha}" }}
                ]
            }}"#,
            len = PAYLOAD.len(),
            sha = PAYLOAD_SHA
        );
        fs::write(&path, json).unwrap();
        path
    }

    fn test_runtime(root: &std::path::Path, fetcher: Arc<FakeFetcher>) -> RuntimeConfig {
        RuntimeConfig {
            cache: CacheConfig {
                root: root.join("cache"),
                fetcher: Some(fetcher),
                on_progress: None,
                manifest_path: Some(write_manifest(root)),
            },
            output_root: root.join("out"),
            worker_count: Some(1),
            on_job_event: None,
            backend: Some(Arc::new(StubBackend::new())),
        }
    }

    #[test]
    fn test_create_requires_paths() {
        let err = Service::create(RuntimeConfig::default(), JobTemplate::default()).unwrap_err();
        assert!(err.to_string().contains("Cache root"));

        let root = scratch_dir("service-paths");
        let runtime = RuntimeConfig {
            cache: CacheConfig {
                root: root.join("cache"),
                ..CacheConfig::default()
            },
            ..RuntimeConfig::default()
        };
        let err = Service::create(runtime, JobTemplate::default()).unwrap_err();
        assert!(err.to_string().contains("Output root"));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_create_makes_directories() {
        let root = scratch_dir("service-dirs");
        let fetcher = Arc::new(FakeFetcher::new(PAYLOAD));
        let service = Service::create(test_runtime(&root, fetcher), JobTemplate::default()).unwrap();
        assert!(root.join("cache").is_dir());
        assert!(root.join("out").is_dir());
        drop(service);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_submit_rejects_empty_input() {
        let root = scratch_dir("service-empty");
        let fetcher = Arc::new(FakeFetcher::new(PAYLOAD));
        let service = Service::create(test_runtime(&root, fetcher), JobTemplate::default()).unwrap();

        let err = service.submit(JobRequest::default()).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_ensure_model_ready_and_purge() {
        let root = scratch_dir("service-models");
        let fetcher = Arc::new(FakeFetcher::new(PAYLOAD));
        let service = Service::create(
            test_runtime(&root, Arc::clone(&fetcher)),
            JobTemplate::default(),
        )
        .unwrap();

        let handle = service
            .ensure_model_ready(ModelProfile::BalancedFourStem)
            .unwrap();
        assert!(!handle.was_cached);
        assert!(handle.weights_path.exists());
        assert_eq!(fetcher.call_count(), 1);

        service
            .purge_models(Some(ModelProfile::BalancedFourStem))
            .unwrap();
        assert!(!handle.weights_path.exists());

        service.purge_models(None).unwrap();
        assert!(!root.join("cache").exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_end_to_end_submission_completes() {
        let root = scratch_dir("service-e2e");
        let input = root.join("track.wav");
        crate::audio::write_wav(
            &input,
            &crate::audio::AudioBuffer {
                sample_rate: crate::audio::SUPPORTED_SAMPLE_RATE,
                channels: 2,
                samples: vec![0.0; 8],
            },
        )
        .unwrap();

        let fetcher = Arc::new(FakeFetcher::new(PAYLOAD));
        let service = Service::create(test_runtime(&root, fetcher), JobTemplate::default()).unwrap();

        let handle = service.submit(JobRequest::new(&input)).unwrap();
        let result = handle.wait();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.output_dir, root.join("out").join("track"));
        for stem in ModelProfile::BalancedSixStem.stems() {
            assert!(result.output_dir.join(format!("{}.wav", stem)).exists());
        }

        service.shutdown();
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_manifest_entry_lookup_via_new() {
        // Manifest::new is the seam embedders use to synthesize tables.
        let manifest = Manifest::new(vec![ManifestEntry {
            profile: ModelProfile::BalancedFourStem,
            profile_key: "balanced-four-stem".into(),
            filename: "w.bin".into(),
            url: "http://example.invalid/w.bin".into(),
            size_bytes: 0,
            sha256: PAYLOAD_SHA.into(),
        }]);
        assert!(manifest.find(ModelProfile::BalancedFourStem).is_some());
        assert!(manifest.find(ModelProfile::BalancedSixStem).is_none());
    }

    #[test]
    fn test_unknown_manifest_path_is_config_error() {
        let root = scratch_dir("service-bad-manifest");
        let runtime = RuntimeConfig {
            cache: CacheConfig {
                root: root.join("cache"),
                manifest_path: Some(root.join("missing.json")),
                ..CacheConfig::default()
            },
            output_root: root.join("out"),
            ..RuntimeConfig::default()
        };
        let err = Service::create(runtime, JobTemplate::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        fs::remove_dir_all(&root).ok();
    }
}
