//! Configuration types for the spectrogram transform, model architecture and synthesis.
//!
//! Configurations are loaded from YAML experiment files using [`load_config`] and
//! validated once with [`Config::validate`] before any model work begins.

use crate::error::Dv3Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Audio analysis parameters shared by training-time feature extraction and the vocoder.
pub struct TransformConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Pre-emphasis coefficient applied before analysis (inverted after synthesis).
    pub preemphasis: f32,
    /// FFT size; the linear spectrogram has `1 + n_fft / 2` bins.
    pub n_fft: usize,
    /// Mel channel count.
    pub n_mels: usize,
    /// Analysis window length in samples.
    pub win_length: usize,
    /// Hop between frames in samples.
    pub hop_length: usize,
    /// Floor of the normalized dB range (negative).
    pub min_level_db: f32,
    /// Reference level subtracted from magnitudes in dB.
    pub ref_level_db: f32,
    /// Probability of replacing a word with its dictionary pronunciation.
    pub replace_pronunciation_prob: f32,
}

impl TransformConfig {
    /// Number of linear-frequency bins.
    pub fn linear_dim(&self) -> usize {
        1 + self.n_fft / 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Architecture hyperparameters.
pub struct ModelConfig {
    /// Number of speakers (1 for single speaker).
    pub n_speakers: usize,
    /// Speaker embedding width.
    pub speaker_embed_dim: usize,
    /// Init std of the speaker table.
    pub speaker_embedding_weight_std: f32,
    /// Mel frames emitted per decoder step (`r`).
    pub outputs_per_step: usize,
    /// Time downsampling of decoder frames relative to the linear spectrogram.
    pub downsample_factor: usize,
    /// Text embedding width.
    pub text_embed_dim: usize,
    /// Convolution kernel size (odd).
    pub kernel_size: usize,
    pub encoder_channels: usize,
    pub decoder_channels: usize,
    pub converter_channels: usize,
    /// Training dropout. Never applied at inference.
    pub dropout: f32,
    /// Padding symbol id.
    pub padding_idx: usize,
    /// Init std of the text embedding.
    pub embedding_weight_std: f32,
    /// Size of the positional encoding tables.
    pub max_positions: usize,
    pub freeze_embedding: bool,
    pub trainable_positional_encodings: bool,
    pub use_memory_mask: bool,
    /// Rate applied to decoder frame positions.
    pub query_position_rate: f32,
    /// Rate applied to text token positions.
    pub key_position_rate: f32,
    /// Tokens behind the focus that remain attendable.
    pub window_backward: usize,
    /// Tokens ahead of the focus that remain attendable.
    pub window_ahead: usize,
    pub key_projection: bool,
    pub value_projection: bool,
    /// Feed decoder states instead of mel frames into the converter.
    pub use_decoder_state_for_postnet_input: bool,
}

impl ModelConfig {
    /// Whether a speaker table is instantiated.
    pub fn multi_speaker(&self) -> bool {
        self.n_speakers > 1
    }
}

/// How the attention focus advances after each decoder step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusMode {
    /// Token with the largest attention weight.
    #[default]
    ArgMax,
    /// Attention-weighted mean token index, rounded.
    Mean,
}

/// Initial phase guess for Griffin-Lim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseInit {
    /// Uniform random phase drawn from a seeded generator.
    #[default]
    Random,
    /// Zero phase.
    Zeros,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Decoding and vocoding parameters.
pub struct SynthesisConfig {
    /// Exponent applied to the linear magnitude before phase reconstruction.
    pub power: f32,
    /// Griffin-Lim iterations.
    pub n_iter: usize,
    /// Hard cutoff on decoder steps.
    #[serde(default = "default_max_decoder_steps")]
    pub max_decoder_steps: usize,
    /// Steps taken before the stop probability is consulted.
    #[serde(default = "default_min_decoder_steps")]
    pub min_decoder_steps: usize,
    /// Stop probability that counts as "done".
    #[serde(default = "default_stop_threshold")]
    pub stop_threshold: f32,
    /// Consecutive done steps required to terminate.
    #[serde(default = "default_stop_patience")]
    pub stop_patience: usize,
    #[serde(default)]
    pub focus: FocusMode,
    /// Fast Griffin-Lim momentum; 0 gives the classic algorithm.
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default)]
    pub phase_init: PhaseInit,
    /// Base seed for phase initialization and pronunciation replacement.
    #[serde(default)]
    pub seed: u64,
    /// Speaker used for every utterance.
    #[serde(default)]
    pub speaker_id: usize,
}

fn default_max_decoder_steps() -> usize {
    200
}

fn default_min_decoder_steps() -> usize {
    10
}

fn default_stop_threshold() -> f32 {
    0.5
}

fn default_stop_patience() -> usize {
    1
}

fn default_momentum() -> f32 {
    0.99
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Text front-end settings.
pub struct FrontendConfig {
    /// Optional CMUdict-format pronunciation dictionary.
    pub cmudict_path: Option<String>,
}

/// Top-level experiment configuration.
///
/// Sections not listed here (`meta_data`, `train`, ...) are ignored so training
/// configs can be used for synthesis unchanged.
///
/// # Example YAML
///
/// ```yaml
/// transform:
///   sample_rate: 22050
///   preemphasis: 0.97
///   n_fft: 1024
///   n_mels: 80
///   win_length: 1024
///   hop_length: 256
///   min_level_db: -100
///   ref_level_db: 20
///   replace_pronunciation_prob: 0.5
/// model:
///   n_speakers: 1
///   outputs_per_step: 4
///   downsample_factor: 4
///   window_backward: 1
///   window_ahead: 3
///   # ...
/// synthesis:
///   power: 1.4
///   n_iter: 32
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub transform: TransformConfig,
    pub model: ModelConfig,
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
}

impl Config {
    /// Check every field once; any failure is a [`Dv3Error::Config`].
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.transform;
        let m = &self.model;
        let s = &self.synthesis;

        ensure(t.sample_rate > 0, "transform.sample_rate must be > 0")?;
        ensure(
            t.n_fft >= 4 && t.n_fft % 2 == 0,
            "transform.n_fft must be an even number >= 4",
        )?;
        ensure(
            t.win_length > 0 && t.win_length <= t.n_fft,
            "transform.win_length must be in 1..=n_fft",
        )?;
        ensure(
            t.hop_length > 0 && t.hop_length <= t.win_length,
            "transform.hop_length must be in 1..=win_length",
        )?;
        ensure(t.n_mels > 0, "transform.n_mels must be > 0")?;
        ensure(t.min_level_db < 0.0, "transform.min_level_db must be negative")?;
        ensure(
            (0.0..1.0).contains(&t.preemphasis),
            "transform.preemphasis must be in [0, 1)",
        )?;
        ensure(
            (0.0..=1.0).contains(&t.replace_pronunciation_prob),
            "transform.replace_pronunciation_prob must be in [0, 1]",
        )?;

        ensure(m.n_speakers >= 1, "model.n_speakers must be >= 1")?;
        ensure(
            !m.multi_speaker() || m.speaker_embed_dim > 0,
            "model.speaker_embed_dim must be > 0 with multiple speakers",
        )?;
        ensure(m.outputs_per_step >= 1, "model.outputs_per_step must be >= 1")?;
        ensure(
            m.downsample_factor.is_power_of_two(),
            "model.downsample_factor must be a power of two",
        )?;
        ensure(
            m.kernel_size % 2 == 1,
            "model.kernel_size must be odd",
        )?;
        ensure(m.text_embed_dim > 0, "model.text_embed_dim must be > 0")?;
        ensure(m.encoder_channels > 0, "model.encoder_channels must be > 0")?;
        ensure(m.decoder_channels > 0, "model.decoder_channels must be > 0")?;
        ensure(m.converter_channels > 0, "model.converter_channels must be > 0")?;
        ensure(
            (0.0..1.0).contains(&m.dropout),
            "model.dropout must be in [0, 1)",
        )?;
        ensure(m.max_positions > 1, "model.max_positions must be > 1")?;
        ensure(
            m.query_position_rate > 0.0 && m.key_position_rate > 0.0,
            "model position rates must be > 0",
        )?;
        ensure(
            !m.use_decoder_state_for_postnet_input
                || m.decoder_channels % m.outputs_per_step == 0,
            "model.decoder_channels must be divisible by outputs_per_step \
             when use_decoder_state_for_postnet_input is set",
        )?;

        ensure(s.power > 0.0, "synthesis.power must be > 0")?;
        ensure(
            (0.0..1.0).contains(&s.momentum),
            "synthesis.momentum must be in [0, 1)",
        )?;
        ensure(
            s.max_decoder_steps >= 1,
            "synthesis.max_decoder_steps must be >= 1",
        )?;
        ensure(
            s.max_decoder_steps < m.max_positions,
            "synthesis.max_decoder_steps must be < model.max_positions",
        )?;
        ensure(
            s.min_decoder_steps <= s.max_decoder_steps,
            "synthesis.min_decoder_steps must not exceed max_decoder_steps",
        )?;
        ensure(s.stop_patience >= 1, "synthesis.stop_patience must be >= 1")?;
        ensure(
            s.speaker_id < m.n_speakers,
            "synthesis.speaker_id must be < model.n_speakers",
        )?;
        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> anyhow::Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Dv3Error::config(message))
    }
}

/// Load and validate a configuration from a YAML file.
///
/// # Errors
///
/// Returns a [`Dv3Error::Config`] if the file doesn't exist, contains invalid
/// YAML, or fails validation.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Dv3Error::config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    let data = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&data)
        .map_err(|e| Dv3Error::config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Resolve a possibly relative path against a config file location.
pub fn resolve_relative_path(config_path: &Path, maybe_relative: &str) -> PathBuf {
    let candidate = Path::new(maybe_relative);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(candidate)
}
