//! Shared test utilities: a tiny experiment config and checkpoint fixtures.
#![allow(dead_code)]

use burn::tensor::Tensor;
use burn_ndarray::{NdArray, NdArrayDevice};
use dv3::checkpoint::save_checkpoint;
use dv3::config::Config;
use dv3::model::TtsModel;
use std::path::{Path, PathBuf};

pub type TestBackend = NdArray<f32>;

/// Iteration the fixture checkpoints are saved at.
pub const ITERATION: u64 = 1000;

/// A complete experiment config sized for fast CPU tests.
pub const TINY_CONFIG: &str = r#"
meta_data:
  dataset: ljspeech
transform:
  sample_rate: 8000
  preemphasis: 0.97
  n_fft: 64
  n_mels: 8
  win_length: 64
  hop_length: 16
  min_level_db: -100
  ref_level_db: 20
  replace_pronunciation_prob: 0.0
model:
  n_speakers: 1
  speaker_embed_dim: 4
  speaker_embedding_weight_std: 0.01
  outputs_per_step: 2
  downsample_factor: 2
  text_embed_dim: 16
  kernel_size: 3
  encoder_channels: 16
  decoder_channels: 16
  converter_channels: 16
  dropout: 0.05
  padding_idx: 0
  embedding_weight_std: 0.1
  max_positions: 64
  freeze_embedding: false
  trainable_positional_encodings: false
  use_memory_mask: true
  query_position_rate: 1.0
  key_position_rate: 1.385
  window_backward: 1
  window_ahead: 3
  key_projection: true
  value_projection: true
  use_decoder_state_for_postnet_input: false
synthesis:
  power: 1.4
  n_iter: 4
  max_decoder_steps: 12
  min_decoder_steps: 2
train:
  batch_size: 16
  learning_rate: 0.001
"#;

pub fn tiny_config() -> Config {
    let config: Config = serde_yaml::from_str(TINY_CONFIG).expect("tiny config parses");
    config.validate().expect("tiny config is valid");
    config
}

/// Write [`TINY_CONFIG`] into `dir` and return its path.
pub fn write_config(dir: &Path) -> PathBuf {
    write_config_with(dir, "")
}

/// Write [`TINY_CONFIG`] with `synthesis_extra` appended to its synthesis
/// section.
pub fn write_config_with(dir: &Path, synthesis_extra: &str) -> PathBuf {
    let path = dir.join("tiny.yaml");
    let yaml = TINY_CONFIG.replace(
        "  min_decoder_steps: 2\n",
        &format!("  min_decoder_steps: 2\n{synthesis_extra}"),
    );
    std::fs::write(&path, yaml).expect("write config");
    path
}

/// Write `text` lines into `dir/sentences.txt`.
pub fn write_text(dir: &Path, lines: &[&str]) -> PathBuf {
    let path = dir.join("sentences.txt");
    std::fs::write(&path, lines.join("\n") + "\n").expect("write text");
    path
}

/// Save a random model as `step-1000` under `output`.
///
/// `done_bias` pins the stop head: large positive values stop at the minimum
/// step count, large negative values never stop.
pub fn write_checkpoint(config: &Config, output: &Path, done_bias: Option<f32>) -> PathBuf {
    let device = NdArrayDevice::default();
    let model = TtsModel::<TestBackend>::from_config(config, &device);
    let mut params = model.state_dict().expect("state dict");
    if let Some(bias) = done_bias {
        let channels = config.model.decoder_channels;
        params
            .insert_tensor(
                "decoder.done_proj.weight",
                Tensor::<TestBackend, 2>::zeros([channels, 1], &device),
            )
            .expect("done weight");
        params
            .insert_tensor(
                "decoder.done_proj.bias",
                Tensor::<TestBackend, 1>::full([1], bias, &device),
            )
            .expect("done bias");
    }
    save_checkpoint(
        params,
        output,
        ITERATION,
        &model.weight_norm_layers(),
    )
    .expect("save checkpoint")
}
