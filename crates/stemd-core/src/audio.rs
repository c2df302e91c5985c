//! Interleaved audio buffers and WAV I/O.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{Error, Result};

/// Sample rate the separation models operate at.
pub const SUPPORTED_SAMPLE_RATE: u32 = 44_100;

/// Interleaved audio samples.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

/// Read a WAV file into an interleaved float buffer. Integer formats
/// are rescaled to `[-1, 1]`.
pub fn load_wav(path: &Path) -> Result<AudioBuffer> {
    let mut reader = WavReader::open(path)
        .map_err(|e| Error::Processing(format!("Failed to read audio file {:?}: {}", path, e)))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Processing(format!("Failed to decode {:?}: {}", path, e)))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Processing(format!("Failed to decode {:?}: {}", path, e)))?
        }
    };

    Ok(AudioBuffer {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        samples,
    })
}

/// Write an interleaved float buffer as a 32-bit float WAV file.
pub fn write_wav(path: &Path, buffer: &AudioBuffer) -> Result<()> {
    let spec = WavSpec {
        channels: buffer.channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)
        .map_err(|e| Error::Processing(format!("Failed to create stem file {:?}: {}", path, e)))?;
    for &sample in &buffer.samples {
        writer
            .write_sample(sample)
            .map_err(|e| Error::Processing(format!("Failed to write stem file {:?}: {}", path, e)))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::Processing(format!("Failed to finalize stem file {:?}: {}", path, e)))?;
    Ok(())
}
