//! Shared test fixtures: scratch directories and fake collaborators
//! injected through the fetcher/backend seams.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::audio::{AudioBuffer, SUPPORTED_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::fetcher::{FetchProgress, WeightFetcher};
use crate::profile::ModelProfile;
use crate::session::{InferenceBackend, InferenceProgress, LoadedModel};

/// A unique, created scratch directory under the system temp dir.
pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let dir = std::env::temp_dir().join(format!(
        "stemd-{}-{}-{}",
        label,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Create a small placeholder input file (submissions only require the
/// path to exist; the audio loader is faked in tests that use this).
pub(crate) fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(path, "data").expect("write placeholder file");
}

/// Stereo silence at the supported sample rate.
pub(crate) fn make_buffer(frames: usize) -> AudioBuffer {
    AudioBuffer {
        sample_rate: SUPPORTED_SAMPLE_RATE,
        channels: 2,
        samples: vec![0.0; frames * 2],
    }
}

/// Fetcher that writes a fixed payload and counts invocations.
pub(crate) struct FakeFetcher {
    payload: Vec<u8>,
    pub(crate) calls: AtomicUsize,
}

impl FakeFetcher {
    pub(crate) fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl WeightFetcher for FakeFetcher {
    fn fetch(&self, _url: &str, destination: &Path, progress: Option<FetchProgress>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, &self.payload)?;
        if let Some(cb) = progress {
            cb(self.payload.len() as u64, self.payload.len() as u64);
        }
        Ok(())
    }
}

/// Fetcher that always fails without writing anything.
pub(crate) struct FailingFetcher;

impl WeightFetcher for FailingFetcher {
    fn fetch(&self, url: &str, _destination: &Path, _progress: Option<FetchProgress>) -> Result<()> {
        Err(Error::Fetch(format!("refusing to fetch {}", url)))
    }
}

/// Backend whose models emit a fixed progress ramp and return silence
/// for every profile stem.
pub(crate) struct StubBackend {
    frames: usize,
}

impl StubBackend {
    pub(crate) fn new() -> Self {
        Self { frames: 4 }
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn load(&self, profile: ModelProfile, _weights_path: &Path) -> Result<Box<dyn LoadedModel>> {
        Ok(Box::new(StubModel {
            stem_count: profile.stems().len(),
            frames: self.frames,
        }))
    }
}

pub(crate) struct StubModel {
    stem_count: usize,
    frames: usize,
}

impl LoadedModel for StubModel {
    fn separate(
        &mut self,
        _audio: &AudioBuffer,
        progress: InferenceProgress,
    ) -> Result<Vec<AudioBuffer>> {
        for fraction in [0.0_f32, 0.25, 0.5, 1.0] {
            if !progress(fraction, "stub") {
                return Err(Error::Cancelled("stub inference interrupted".into()));
            }
        }
        Ok((0..self.stem_count).map(|_| make_buffer(self.frames)).collect())
    }
}
