use anyhow::{bail, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

#[derive(Debug, Default)]
pub struct WavIo;

impl WavIo {
    /// Read a WAV file, downmixing to mono.
    pub fn read_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;
        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            SampleFormat::Int => {
                let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect::<Result<_, _>>()?
            }
        };
        let mono = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        Ok((mono, spec.sample_rate))
    }

    /// Write mono 16-bit PCM. Samples are clamped to `[-1, 1]`.
    pub fn write_mono(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            bail!("sample rate must be positive");
        }
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for &value in samples {
            let scaled = (value.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer.write_sample(scaled)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

/// Clip every sample to `[-1, 1]`. Non-finite samples become silence.
pub fn clip_samples(samples: &mut [f32]) {
    for v in samples.iter_mut() {
        *v = if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
    }
}
