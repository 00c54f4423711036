//! Normalized dB spectrograms and the vocoder that turns them back into audio.
//!
//! Analysis: pre-emphasis → STFT magnitude → dB − `ref_level_db` → scale
//! `[min_level_db, 0]` dB onto `[0, 1]`. [`Vocoder::reconstruct`] walks the chain
//! backwards: clip and denormalize, add the reference level, convert to
//! amplitude, raise to `power`, Griffin-Lim, de-emphasis.

use super::griffin_lim::GriffinLim;
use super::stft::Stft;
use crate::config::{Config, SynthesisConfig, TransformConfig};
use crate::error::Dv3Error;
use crate::perf::{self, Metric};
use anyhow::{anyhow, ensure, Result};
use burn::tensor::{backend::Backend, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Time-major magnitude array.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub frames: usize,
    pub bins: usize,
    pub data: Vec<f32>,
}

impl Spectrogram {
    pub fn new(frames: usize, bins: usize, data: Vec<f32>) -> Result<Self> {
        ensure!(
            data.len() == frames * bins,
            "spectrogram {frames}x{bins} needs {} values, got {}",
            frames * bins,
            data.len()
        );
        Ok(Self { frames, bins, data })
    }

    /// Copy a `[frames, bins]` tensor to the host.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 2>) -> Result<Self> {
        let [frames, bins] = tensor.dims();
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("read spectrogram: {e:?}"))?;
        Self::new(frames, bins, data)
    }

    pub fn row(&self, frame: usize) -> &[f32] {
        &self.data[frame * self.bins..(frame + 1) * self.bins]
    }
}

/// `y[n] = x[n] - coef · x[n-1]`
pub fn preemphasis(signal: &[f32], coef: f32) -> Vec<f32> {
    let mut prev = 0.0;
    signal
        .iter()
        .map(|&x| {
            let y = x - coef * prev;
            prev = x;
            y
        })
        .collect()
}

/// `y[n] = x[n] + coef · y[n-1]`, the inverse of [`preemphasis`].
pub fn deemphasis(signal: &[f64], coef: f64) -> Vec<f64> {
    let mut prev = 0.0;
    signal
        .iter()
        .map(|&x| {
            prev = x + coef * prev;
            prev
        })
        .collect()
}

/// Forward and inverse mapping between audio and normalized spectrograms.
#[derive(Debug)]
pub struct SpectrogramTransform {
    config: TransformConfig,
    stft: Stft,
}

impl SpectrogramTransform {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            config: config.clone(),
            stft: Stft::new(config.n_fft, config.win_length, config.hop_length),
        }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Normalized linear spectrogram of a waveform.
    pub fn analyze(&self, signal: &[f32]) -> Spectrogram {
        let emphasized: Vec<f64> = preemphasis(signal, self.config.preemphasis)
            .into_iter()
            .map(f64::from)
            .collect();
        let frames = self.stft.analyze(&emphasized);
        let bins = self.stft.bins();
        let min_db = self.config.min_level_db as f64;
        let ref_db = self.config.ref_level_db as f64;
        let mut data = Vec::with_capacity(frames.len() * bins);
        for row in &frames {
            for c in row {
                let db = 20.0 * c.norm().max(1e-5).log10() - ref_db;
                data.push(((db - min_db) / -min_db).clamp(0.0, 1.0) as f32);
            }
        }
        Spectrogram {
            frames: frames.len(),
            bins,
            data,
        }
    }

    /// Linear amplitude from a normalized spectrogram, rows as `f64`.
    pub fn denormalize(&self, spec: &Spectrogram, power: f32) -> Vec<Vec<f64>> {
        let min_db = self.config.min_level_db as f64;
        let ref_db = self.config.ref_level_db as f64;
        let power = power as f64;
        (0..spec.frames)
            .map(|f| {
                spec.row(f)
                    .iter()
                    .map(|&s| {
                        let db = (s as f64).clamp(0.0, 1.0) * -min_db + min_db + ref_db;
                        10f64.powf(db / 20.0).powf(power)
                    })
                    .collect()
            })
            .collect()
    }
}

/// Normalized linear spectrogram → waveform.
#[derive(Debug)]
pub struct Vocoder {
    transform: SpectrogramTransform,
    griffin_lim: GriffinLim,
    power: f32,
}

impl Vocoder {
    pub fn new(transform: &TransformConfig, synthesis: &SynthesisConfig) -> Self {
        let stft = Stft::new(transform.n_fft, transform.win_length, transform.hop_length);
        Self {
            transform: SpectrogramTransform::new(transform),
            griffin_lim: GriffinLim::new(
                stft,
                synthesis.n_iter,
                synthesis.momentum,
                synthesis.phase_init,
            ),
            power: synthesis.power,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.transform, &config.synthesis)
    }

    pub fn transform(&self) -> &SpectrogramTransform {
        &self.transform
    }

    /// Samples produced for a spectrogram of `frames` frames.
    pub fn output_len(&self, frames: usize) -> usize {
        frames * self.transform.config.hop_length
    }

    /// Reconstruct audio. `seed` drives the random initial phase.
    ///
    /// # Errors
    ///
    /// [`Dv3Error::Reconstruction`] if any sample is NaN or infinite.
    pub fn reconstruct(&self, normalized: &Spectrogram, seed: u64) -> Result<Vec<f32>> {
        let _span = perf::span(Metric::VocoderTotal);
        let expected_bins = self.transform.stft.bins();
        ensure!(
            normalized.bins == expected_bins,
            "spectrogram has {} bins, transform expects {expected_bins}",
            normalized.bins
        );
        let magnitude = self.transform.denormalize(normalized, self.power);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let length = self.output_len(normalized.frames);
        let signal = self.griffin_lim.reconstruct(&magnitude, &mut rng, Some(length));
        let signal = deemphasis(&signal, self.transform.config.preemphasis as f64);

        let non_finite = signal.iter().filter(|v| !v.is_finite()).count();
        if non_finite > 0 {
            return Err(Dv3Error::Reconstruction {
                non_finite,
                total: signal.len(),
            }
            .into());
        }
        perf::add_count(Metric::WaveformSamples, signal.len() as u64);
        debug!(frames = normalized.frames, samples = signal.len(), "vocoded");
        Ok(signal.into_iter().map(|v| v as f32).collect())
    }
}
