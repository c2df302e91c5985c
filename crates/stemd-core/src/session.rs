//! Loaded-model sessions and the inference backend seam.
//!
//! The backend is a capability trait so the heavy inference runtime can
//! be swapped without touching the job machinery; tests inject stubs
//! through the same seam.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::{AudioBuffer, SUPPORTED_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::profile::ModelProfile;

/// Progress sink for long-running inference: `(fraction, message)`.
/// Returning `false` asks the backend to stop as soon as practical.
pub type InferenceProgress<'a> = &'a mut dyn FnMut(f32, &str) -> bool;

/// A model loaded into memory, ready to run inference.
pub trait LoadedModel: Send {
    /// Separate interleaved stereo audio into one buffer per profile
    /// stem, in profile order.
    fn separate(
        &mut self,
        audio: &AudioBuffer,
        progress: InferenceProgress,
    ) -> Result<Vec<AudioBuffer>>;
}

/// Loads model weights into memory.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, profile: ModelProfile, weights_path: &Path) -> Result<Box<dyn LoadedModel>>;

    fn is_available(&self) -> bool {
        true
    }

    fn unavailable_reason(&self) -> Option<&'static str> {
        None
    }
}

/// Resolves the weight path for a session, typically by asking the
/// model cache to ensure the blob is on disk.
pub type WeightResolver = Box<dyn Fn() -> Result<PathBuf> + Send>;

/// A separation session. The model is loaded on first use and kept in
/// memory for the session's lifetime; the session pool reuses sessions
/// across jobs so the load cost is paid once per profile per worker.
pub struct ModelSession {
    profile: ModelProfile,
    resolver: WeightResolver,
    backend: Arc<dyn InferenceBackend>,
    model: Option<Box<dyn LoadedModel>>,
}

impl ModelSession {
    pub fn new(
        profile: ModelProfile,
        resolver: WeightResolver,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            profile,
            resolver,
            backend,
            model: None,
        }
    }

    pub fn profile(&self) -> ModelProfile {
        self.profile
    }

    /// Separate `input` into the requested stems. An empty filter means
    /// every stem the profile produces.
    pub fn separate(
        &mut self,
        input: &AudioBuffer,
        stems_filter: &[String],
        progress: InferenceProgress,
    ) -> Result<Vec<(String, AudioBuffer)>> {
        if input.channels != 2 {
            return Err(Error::Processing("Separation expects stereo input".into()));
        }
        if input.sample_rate != SUPPORTED_SAMPLE_RATE {
            return Err(Error::Processing(format!(
                "Input sample rate {} is unsupported, expected {}",
                input.sample_rate, SUPPORTED_SAMPLE_RATE
            )));
        }

        let indices = self.resolve_stem_indices(stems_filter)?;
        let profile = self.profile;
        let model = self.ensure_model_loaded()?;
        let outputs = model.separate(input, progress)?;

        let stems = profile.stems();
        if outputs.len() < stems.len() {
            return Err(Error::Processing(format!(
                "Backend returned {} stems, profile {} declares {}",
                outputs.len(),
                profile.key(),
                stems.len()
            )));
        }

        let mut outputs: Vec<Option<AudioBuffer>> = outputs.into_iter().map(Some).collect();
        let mut result = Vec::with_capacity(indices.len());
        for idx in indices {
            let buffer = outputs[idx].take().ok_or_else(|| {
                Error::InvalidInput(format!("Duplicate stem requested: {}", stems[idx]))
            })?;
            result.push((stems[idx].to_string(), buffer));
        }
        Ok(result)
    }

    fn ensure_model_loaded(&mut self) -> Result<&mut Box<dyn LoadedModel>> {
        if self.model.is_none() {
            let weights = (self.resolver)()?;
            log::info!(
                "session: loading {} weights from {:?} via {}",
                self.profile.key(),
                weights,
                self.backend.name()
            );
            self.model = Some(self.backend.load(self.profile, &weights)?);
        }
        match self.model.as_mut() {
            Some(model) => Ok(model),
            None => Err(Error::Processing("Model failed to load".into())),
        }
    }

    fn resolve_stem_indices(&self, stems: &[String]) -> Result<Vec<usize>> {
        let all = self.profile.stems();
        if stems.is_empty() {
            return Ok((0..all.len()).collect());
        }
        stems
            .iter()
            .map(|requested| {
                all.iter()
                    .position(|s| s == requested)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!("Unknown stem requested: {}", requested))
                    })
            })
            .collect()
    }
}

/// Native demucs backend.
///
/// TODO: bind the demucs.cpp ggml runtime over FFI; until the native
/// library is vendored this backend reports itself unavailable and
/// model loading fails with the reason below. Jobs exercise the full
/// pipeline with backends injected via `RuntimeConfig`.
pub struct DemucsBackend;

impl DemucsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DemucsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for DemucsBackend {
    fn name(&self) -> &'static str {
        "demucs"
    }

    fn load(&self, _profile: ModelProfile, _weights_path: &Path) -> Result<Box<dyn LoadedModel>> {
        Err(Error::Processing(
            self.unavailable_reason()
                .unwrap_or("demucs backend unavailable")
                .to_string(),
        ))
    }

    fn is_available(&self) -> bool {
        false
    }

    fn unavailable_reason(&self) -> Option<&'static str> {
        Some("demucs inference requires the native demucs.cpp runtime, which is not linked into this build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_buffer, StubBackend};

    fn stub_session(profile: ModelProfile) -> ModelSession {
        ModelSession::new(
            profile,
            Box::new(|| Ok(PathBuf::from("stub-weights.bin"))),
            Arc::new(StubBackend::new()),
        )
    }

    fn always_continue(_: f32, _: &str) -> bool {
        true
    }

    #[test]
    fn test_separate_all_stems_in_profile_order() {
        let mut session = stub_session(ModelProfile::BalancedFourStem);
        let stems = session
            .separate(&make_buffer(4), &[], &mut always_continue)
            .unwrap();
        let names: Vec<&str> = stems.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["vocals", "drums", "bass", "other"]);
    }

    #[test]
    fn test_separate_with_filter() {
        let mut session = stub_session(ModelProfile::BalancedSixStem);
        let filter = vec!["guitar".to_string(), "vocals".to_string()];
        let stems = session
            .separate(&make_buffer(4), &filter, &mut always_continue)
            .unwrap();
        let names: Vec<&str> = stems.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["guitar", "vocals"]);
    }

    #[test]
    fn test_unknown_stem_rejected() {
        let mut session = stub_session(ModelProfile::BalancedFourStem);
        let filter = vec!["piano".to_string()];
        let err = session
            .separate(&make_buffer(4), &filter, &mut always_continue)
            .unwrap_err();
        assert!(err.to_string().contains("Unknown stem"));
    }

    #[test]
    fn test_mono_input_rejected() {
        let mut session = stub_session(ModelProfile::BalancedFourStem);
        let mono = AudioBuffer {
            sample_rate: SUPPORTED_SAMPLE_RATE,
            channels: 1,
            samples: vec![0.0; 8],
        };
        assert!(session
            .separate(&mono, &[], &mut always_continue)
            .is_err());
    }

    #[test]
    fn test_progress_abort_stops_inference() {
        let mut session = stub_session(ModelProfile::BalancedFourStem);
        let mut stop_immediately = |_: f32, _: &str| false;
        let err = session
            .separate(&make_buffer(4), &[], &mut stop_immediately)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn test_demucs_backend_reports_unavailable() {
        let backend = DemucsBackend::new();
        assert!(!backend.is_available());
        assert!(backend.unavailable_reason().is_some());
        assert!(backend
            .load(ModelProfile::BalancedFourStem, Path::new("w.bin"))
            .is_err());
    }
}
