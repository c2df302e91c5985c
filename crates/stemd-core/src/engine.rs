//! The separation driver: loads audio, runs a pooled model session,
//! and writes one WAV file per requested stem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::audio::{self, AudioBuffer};
use crate::error::{Error, Result};
use crate::job::JobDescriptor;
use crate::session_pool::SessionPool;

pub type AudioLoader = Box<dyn Fn(&Path) -> Result<AudioBuffer> + Send + Sync>;
pub type AudioWriter = Box<dyn Fn(&Path, &AudioBuffer) -> Result<()> + Send + Sync>;

/// Progress sink: `(fraction in [0, 1], message)`.
pub type EngineProgress<'a> = &'a (dyn Fn(f32, &str) + Send + Sync);

pub struct SeparationEngine {
    sessions: SessionPool,
    loader: AudioLoader,
    writer: AudioWriter,
}

impl SeparationEngine {
    pub fn new(sessions: SessionPool) -> Self {
        Self::with_io(
            sessions,
            Box::new(|path| audio::load_wav(path)),
            Box::new(|path, buffer| audio::write_wav(path, buffer)),
        )
    }

    /// Engine with injected audio I/O, the seam tests use.
    pub fn with_io(sessions: SessionPool, loader: AudioLoader, writer: AudioWriter) -> Self {
        Self {
            sessions,
            loader,
            writer,
        }
    }

    /// Run one job start to finish and return its output directory.
    /// The stop flag is checked between stages; inference observes it
    /// through the progress callback.
    pub fn process(
        &self,
        job: &JobDescriptor,
        stop: &AtomicBool,
        progress: EngineProgress,
    ) -> Result<PathBuf> {
        let input = (self.loader)(&job.input_path)?;

        if stop.load(Ordering::SeqCst) {
            return Err(Error::Cancelled("Separation stopped before inference".into()));
        }

        let mut session = self.sessions.acquire(job.config.profile)?;

        let mut interrupted = false;
        let outcome = {
            let mut forward = |fraction: f32, message: &str| -> bool {
                progress(fraction, message);
                if stop.load(Ordering::SeqCst) {
                    interrupted = true;
                    return false;
                }
                true
            };
            session.separate(&input, &job.config.stems_filter, &mut forward)
        };

        let stems = match outcome {
            Ok(stems) => stems,
            Err(_) if interrupted => {
                return Err(Error::Cancelled("Separation stopped by cancellation".into()))
            }
            Err(e) => return Err(e),
        };

        if stop.load(Ordering::SeqCst) {
            return Err(Error::Cancelled(
                "Separation stopped before writing stems".into(),
            ));
        }

        fs::create_dir_all(&job.output_dir).map_err(|e| {
            Error::Processing(format!(
                "Failed to create output directory {:?}: {}",
                job.output_dir, e
            ))
        })?;

        for (name, buffer) in &stems {
            if stop.load(Ordering::SeqCst) {
                return Err(Error::Cancelled(
                    "Separation stopped while writing stems".into(),
                ));
            }
            let stem_path = job.output_dir.join(format!("{}.wav", name));
            (self.writer)(&stem_path, buffer)?;
        }

        log::info!(
            "process: wrote {} stems to {:?}",
            stems.len(),
            job.output_dir
        );
        Ok(job.output_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobTemplate;
    use crate::profile::ModelProfile;
    use crate::session::ModelSession;
    use crate::session_pool::SessionFactory;
    use crate::testutil::{scratch_dir, StubBackend};
    use std::sync::Arc;

    fn stub_factory() -> SessionFactory {
        Box::new(|profile| {
            Ok(ModelSession::new(
                profile,
                Box::new(|| Ok(PathBuf::from("stub-weights.bin"))),
                Arc::new(StubBackend::new()),
            ))
        })
    }

    fn stub_engine() -> SeparationEngine {
        SeparationEngine::with_io(
            SessionPool::new(stub_factory()),
            Box::new(|_| Ok(crate::testutil::make_buffer(4))),
            Box::new(|path, buffer| audio::write_wav(path, buffer)),
        )
    }

    fn make_job(output_dir: PathBuf, profile: ModelProfile) -> JobDescriptor {
        JobDescriptor {
            input_path: PathBuf::from("/music/first.wav"),
            config: JobTemplate {
                profile,
                stems_filter: Vec::new(),
            },
            output_dir,
        }
    }

    #[test]
    fn test_process_writes_one_wav_per_stem() {
        let root = scratch_dir("engine");
        let job = make_job(root.join("first"), ModelProfile::BalancedSixStem);
        let stop = AtomicBool::new(false);

        let dir = stub_engine().process(&job, &stop, &|_, _| {}).unwrap();
        assert_eq!(dir, job.output_dir);
        for stem in ModelProfile::BalancedSixStem.stems() {
            assert!(dir.join(format!("{}.wav", stem)).exists());
        }

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_process_reports_progress() {
        let root = scratch_dir("engine-progress");
        let job = make_job(root.join("first"), ModelProfile::BalancedFourStem);
        let stop = AtomicBool::new(false);
        let fractions: Arc<std::sync::Mutex<Vec<f32>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = Arc::clone(&fractions);
        stub_engine()
            .process(&job, &stop, &move |fraction, _| {
                sink.lock().unwrap().push(fraction);
            })
            .unwrap();

        assert_eq!(*fractions.lock().unwrap(), vec![0.0, 0.25, 0.5, 1.0]);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_pre_set_stop_flag_cancels() {
        let root = scratch_dir("engine-stop");
        let job = make_job(root.join("first"), ModelProfile::BalancedFourStem);
        let stop = AtomicBool::new(true);

        let err = stub_engine().process(&job, &stop, &|_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!job.output_dir.exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_loader_error_propagates() {
        let engine = SeparationEngine::with_io(
            SessionPool::new(stub_factory()),
            Box::new(|path| Err(Error::Processing(format!("unreadable: {:?}", path)))),
            Box::new(|_, _| Ok(())),
        );
        let job = make_job(PathBuf::from("/nowhere"), ModelProfile::BalancedFourStem);
        let stop = AtomicBool::new(false);

        let err = engine.process(&job, &stop, &|_, _| {}).unwrap_err();
        assert!(err.to_string().contains("unreadable"));
    }
}
