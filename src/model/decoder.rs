//! Autoregressive mel decoder with windowed attention and stop prediction.
//!
//! Each step consumes the previous group of `r` mel frames (zeros for the first
//! step), runs it through a prenet and causal gated conv blocks, attends to the
//! encoder output after the first and last attentive block, and emits the next
//! `r` frames plus a stop probability.

use crate::config::{FocusMode, SynthesisConfig};
use crate::model::encoder::EncoderOutput;
use crate::modules::attention::{AttentionMemory, AttentionState, WindowedAttention};
use crate::modules::conv_block::GatedConvBlock;
use crate::modules::position::{angle_table, PositionEncoding};
use crate::modules::streaming_conv::StreamingConvState;
use crate::perf::{self, Metric};
use crate::state::StreamingModule;
use crate::weights::{export_linear, linear_weight_norm, load_linear, ParamStore, WeightNormLayer};
use anyhow::{ensure, Result};
use burn::tensor::{
    activation::{relu, sigmoid},
    backend::Backend,
    ElementConversion, Tensor,
};
use burn_nn::{Linear, LinearConfig};
use tracing::{debug, warn};

/// Dilations of the causal blocks before the first attention.
pub const PREATTENTION_DILATIONS: [usize; 2] = [1, 3];
/// Dilations of the attentive causal blocks.
pub const DECODER_DILATIONS: [usize; 5] = [1, 3, 9, 27, 1];
/// Attentive blocks followed by an attention layer.
pub const ATTENTION_AFTER: [usize; 2] = [0, 4];

/// Step limits and stop rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    pub max_steps: usize,
    pub min_steps: usize,
    pub stop_threshold: f32,
    pub stop_patience: usize,
}

impl From<&SynthesisConfig> for DecodeOptions {
    fn from(config: &SynthesisConfig) -> Self {
        Self {
            max_steps: config.max_decoder_steps,
            min_steps: config.min_decoder_steps,
            stop_threshold: config.stop_threshold,
            stop_patience: config.stop_patience,
        }
    }
}

/// Attention weights of one layer, row per decoder step, column per token.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMatrix {
    pub steps: usize,
    pub tokens: usize,
    pub data: Vec<f32>,
}

impl AttentionMatrix {
    pub fn new(tokens: usize) -> Self {
        Self {
            steps: 0,
            tokens,
            data: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.tokens);
        self.data.extend_from_slice(row);
        self.steps += 1;
    }

    pub fn row(&self, step: usize) -> &[f32] {
        &self.data[step * self.tokens..(step + 1) * self.tokens]
    }
}

/// Everything one decode produces.
#[derive(Debug, Clone)]
pub struct DecodeOutput<B: Backend> {
    /// `[steps · r, n_mels]`, values in `[0, 1]`.
    pub mel: Tensor<B, 2>,
    /// Final hidden state per step, `[steps, decoder_channels]`.
    pub states: Tensor<B, 2>,
    /// One matrix per attention layer.
    pub alignments: Vec<AttentionMatrix>,
    /// Stop probability per step.
    pub done: Vec<f32>,
    pub steps: usize,
    /// The step limit was hit before the stop rule fired.
    pub truncated: bool,
}

/// Incremental state for one utterance.
#[derive(Debug, Clone)]
pub struct DecoderState<B: Backend> {
    pub preattention: Vec<StreamingConvState<B>>,
    pub blocks: Vec<StreamingConvState<B>>,
    pub attention: Vec<AttentionState>,
}

/// Output of a single step.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// `[1, n_mels · r]`
    pub frames: Tensor<B, 2>,
    /// `[1, decoder_channels]`
    pub hidden: Tensor<B, 2>,
    pub done: f32,
    /// Weights per attention layer.
    pub weights: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct Decoder<B: Backend> {
    pub prenet: Linear<B>,
    pub preattention: Vec<GatedConvBlock<B>>,
    pub blocks: Vec<GatedConvBlock<B>>,
    pub attention: Vec<WindowedAttention<B>>,
    pub query_position: PositionEncoding<B>,
    pub key_position: PositionEncoding<B>,
    pub mel_proj: Linear<B>,
    pub done_proj: Linear<B>,
    pub n_mels: usize,
    pub outputs_per_step: usize,
    pub channels: usize,
}

/// Decoder hyperparameters gathered from the model section.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub n_mels: usize,
    pub outputs_per_step: usize,
    pub channels: usize,
    pub embed_dim: usize,
    pub kernel_size: usize,
    pub speaker_dim: Option<usize>,
    pub dropout: f32,
    pub query_position_rate: f32,
    pub key_position_rate: f32,
    pub trainable_positions: Option<usize>,
    pub window_backward: usize,
    pub window_ahead: usize,
    pub key_projection: bool,
    pub value_projection: bool,
}

impl<B: Backend> Decoder<B> {
    pub fn init(config: &DecoderConfig, device: &B::Device) -> Self {
        let c = config.channels;
        let frame_dim = config.n_mels * config.outputs_per_step;
        let block = |d: usize| {
            GatedConvBlock::init(
                c,
                config.kernel_size,
                d,
                true,
                config.speaker_dim,
                config.dropout,
                device,
            )
        };
        let attention = ATTENTION_AFTER
            .iter()
            .map(|_| {
                WindowedAttention::init(
                    c,
                    config.embed_dim,
                    config.key_projection,
                    config.value_projection,
                    config.window_backward,
                    config.window_ahead,
                    device,
                )
            })
            .collect();
        let (query_position, key_position) = match config.trainable_positions {
            Some(max_positions) => (
                PositionEncoding::Table {
                    angles: angle_table(max_positions, c, device),
                    rate: config.query_position_rate,
                },
                PositionEncoding::Table {
                    angles: angle_table(max_positions, config.embed_dim, device),
                    rate: config.key_position_rate,
                },
            ),
            None => (
                PositionEncoding::Sinusoid {
                    dim: c,
                    rate: config.query_position_rate,
                },
                PositionEncoding::Sinusoid {
                    dim: config.embed_dim,
                    rate: config.key_position_rate,
                },
            ),
        };
        Self {
            prenet: LinearConfig::new(frame_dim, c).init(device),
            preattention: PREATTENTION_DILATIONS.iter().map(|&d| block(d)).collect(),
            blocks: DECODER_DILATIONS.iter().map(|&d| block(d)).collect(),
            attention,
            query_position,
            key_position,
            mel_proj: LinearConfig::new(c, frame_dim).init(device),
            done_proj: LinearConfig::new(c, 1).init(device),
            n_mels: config.n_mels,
            outputs_per_step: config.outputs_per_step,
            channels: c,
        }
    }

    /// Apply the same focus rule to every attention layer.
    pub fn set_focus_mode(&mut self, mode: FocusMode) {
        for layer in &mut self.attention {
            layer.focus_mode = mode;
        }
    }

    pub fn frame_dim(&self) -> usize {
        self.n_mels * self.outputs_per_step
    }

    /// Project encoder keys/values once per attention layer. Tokens sit at
    /// positions `1..=T`.
    pub fn prepare_memory(&self, encoder: &EncoderOutput<B>) -> Vec<AttentionMemory<B>> {
        let device = encoder.keys.device();
        let positions = self.key_position.rows(1, encoder.tokens(), &device);
        self.attention
            .iter()
            .map(|layer| {
                layer.prepare(
                    encoder.keys.clone(),
                    encoder.values.clone(),
                    positions.clone(),
                )
            })
            .collect()
    }

    /// Run one decoder step on the previous frame group `[1, n_mels · r]`.
    pub fn step(
        &self,
        state: &mut DecoderState<B>,
        memory: &[AttentionMemory<B>],
        frames: Tensor<B, 2>,
        step: usize,
        speaker: Option<&Tensor<B, 2>>,
    ) -> Result<StepOutput<B>> {
        let _span = perf::span(Metric::DecoderStep);
        let device = frames.device();
        let c = self.channels;
        let mut x = relu(self.prenet.forward(frames)).reshape([1, c, 1]);
        for (block, conv_state) in self.preattention.iter().zip(state.preattention.iter_mut()) {
            x = block.step(conv_state, x, speaker);
        }

        let query_position = self.query_position.rows(step + 1, 1, &device);
        let mut weights = Vec::with_capacity(self.attention.len());
        let mut layer = 0;
        for (i, (block, conv_state)) in self.blocks.iter().zip(state.blocks.iter_mut()).enumerate() {
            x = block.step(conv_state, x, speaker);
            if ATTENTION_AFTER.contains(&i) {
                let _span = perf::span(Metric::AttentionStep);
                let query = x.reshape([1, c]) + query_position.clone();
                let (out, w) = self.attention[layer].step(
                    &mut state.attention[layer],
                    &memory[layer],
                    query,
                )?;
                weights.push(w);
                x = out.reshape([1, c, 1]);
                layer += 1;
            }
        }

        let hidden = x.reshape([1, c]);
        let frames = sigmoid(self.mel_proj.forward(hidden.clone()));
        let done = sigmoid(self.done_proj.forward(hidden.clone()))
            .reshape([1])
            .into_scalar()
            .elem::<f32>();
        Ok(StepOutput {
            frames,
            hidden,
            done,
            weights,
        })
    }

    /// Decode until the stop rule fires or `max_steps` is reached.
    pub fn decode(
        &self,
        encoder: &EncoderOutput<B>,
        speaker: Option<&Tensor<B, 2>>,
        options: &DecodeOptions,
    ) -> Result<DecodeOutput<B>> {
        ensure!(options.max_steps >= 1, "max_steps must be at least 1");
        let _span = perf::span(Metric::DecoderTotal);
        let device = encoder.keys.device();
        let tokens = encoder.tokens();
        let memory = self.prepare_memory(encoder);
        let mut state = self.init_state(&device);

        let mut frames = Tensor::<B, 2>::zeros([1, self.frame_dim()], &device);
        let mut mel = Vec::with_capacity(options.max_steps);
        let mut hidden = Vec::with_capacity(options.max_steps);
        let mut alignments = vec![AttentionMatrix::new(tokens); self.attention.len()];
        let mut done = Vec::with_capacity(options.max_steps);
        let mut consecutive = 0;
        let mut stopped = false;

        for step in 0..options.max_steps {
            let out = self.step(&mut state, &memory, frames, step, speaker)?;
            for (matrix, row) in alignments.iter_mut().zip(&out.weights) {
                matrix.push_row(row);
            }
            mel.push(out.frames.clone());
            hidden.push(out.hidden);
            done.push(out.done);
            frames = out.frames;

            if step + 1 >= options.min_steps && out.done > options.stop_threshold {
                consecutive += 1;
            } else {
                consecutive = 0;
            }
            if consecutive >= options.stop_patience {
                stopped = true;
                break;
            }
        }

        let steps = mel.len();
        perf::add_count(Metric::DecoderSteps, steps as u64);
        let truncated = !stopped;
        if truncated {
            warn!(steps, "decoder hit max steps before the stop condition");
        } else {
            debug!(steps, tokens, "decoder stopped");
        }
        let mel = Tensor::cat(mel, 0).reshape([steps * self.outputs_per_step, self.n_mels]);
        Ok(DecodeOutput {
            mel,
            states: Tensor::cat(hidden, 0),
            alignments,
            done,
            steps,
            truncated,
        })
    }

    pub fn load(&mut self, store: &ParamStore, prefix: &str, device: &B::Device) -> Result<()> {
        load_linear(&mut self.prenet, store, &format!("{prefix}.prenet"), device)?;
        for (i, block) in self.preattention.iter_mut().enumerate() {
            block.load(store, &format!("{prefix}.preattention.{i}"), device)?;
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.load(store, &format!("{prefix}.blocks.{i}"), device)?;
        }
        for (i, layer) in self.attention.iter_mut().enumerate() {
            layer.load(store, &format!("{prefix}.attention.{i}"), device)?;
        }
        for (name, encoding) in [
            ("query_position", &mut self.query_position),
            ("key_position", &mut self.key_position),
        ] {
            if let PositionEncoding::Table { angles, .. } = encoding {
                let dims = angles.dims();
                *angles = store.tensor(&format!("{prefix}.{name}.weight"), dims, device)?;
            }
        }
        load_linear(&mut self.mel_proj, store, &format!("{prefix}.mel_proj"), device)?;
        load_linear(&mut self.done_proj, store, &format!("{prefix}.done_proj"), device)
    }

    pub fn export(&self, store: &mut ParamStore, prefix: &str) -> Result<()> {
        export_linear(&self.prenet, store, &format!("{prefix}.prenet"))?;
        for (i, block) in self.preattention.iter().enumerate() {
            block.export(store, &format!("{prefix}.preattention.{i}"))?;
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.export(store, &format!("{prefix}.blocks.{i}"))?;
        }
        for (i, layer) in self.attention.iter().enumerate() {
            layer.export(store, &format!("{prefix}.attention.{i}"))?;
        }
        for (name, encoding) in [
            ("query_position", &self.query_position),
            ("key_position", &self.key_position),
        ] {
            if let PositionEncoding::Table { angles, .. } = encoding {
                store.insert_tensor(format!("{prefix}.{name}.weight"), angles.clone())?;
            }
        }
        export_linear(&self.mel_proj, store, &format!("{prefix}.mel_proj"))?;
        export_linear(&self.done_proj, store, &format!("{prefix}.done_proj"))
    }

    pub fn weight_norm_layers(&self, prefix: &str, out: &mut Vec<WeightNormLayer>) {
        out.push(linear_weight_norm(&format!("{prefix}.prenet")));
        for (i, block) in self.preattention.iter().enumerate() {
            block.weight_norm_layers(&format!("{prefix}.preattention.{i}"), out);
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.weight_norm_layers(&format!("{prefix}.blocks.{i}"), out);
        }
        for (i, layer) in self.attention.iter().enumerate() {
            layer.weight_norm_layers(&format!("{prefix}.attention.{i}"), out);
        }
        out.push(linear_weight_norm(&format!("{prefix}.mel_proj")));
        out.push(linear_weight_norm(&format!("{prefix}.done_proj")));
    }

    /// Pin the stop probability: zero weights, constant bias.
    #[cfg(test)]
    pub(crate) fn set_done_bias(&mut self, bias: f32, device: &B::Device) {
        use burn::module::Param;
        self.done_proj.weight = Param::from_tensor(Tensor::zeros([self.channels, 1], device));
        self.done_proj.bias = Some(Param::from_tensor(Tensor::full([1], bias, device)));
    }
}

impl<B: Backend> StreamingModule<B> for Decoder<B> {
    type State = DecoderState<B>;

    fn init_state(&self, device: &B::Device) -> Self::State {
        DecoderState {
            preattention: self
                .preattention
                .iter()
                .map(|b| b.init_state(device))
                .collect(),
            blocks: self.blocks.iter().map(|b| b.init_state(device)).collect(),
            attention: vec![AttentionState::default(); self.attention.len()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::attention::window_bounds;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn config(window_backward: usize, window_ahead: usize) -> DecoderConfig {
        DecoderConfig {
            n_mels: 4,
            outputs_per_step: 2,
            channels: 8,
            embed_dim: 6,
            kernel_size: 3,
            speaker_dim: None,
            dropout: 0.0,
            query_position_rate: 1.0,
            key_position_rate: 1.385,
            trainable_positions: None,
            window_backward,
            window_ahead,
            key_projection: true,
            value_projection: true,
        }
    }

    fn encoder_output(tokens: usize, device: &NdArrayDevice) -> EncoderOutput<TestBackend> {
        EncoderOutput {
            keys: Tensor::random([tokens, 6], Distribution::Normal(0.0, 1.0), device),
            values: Tensor::random([tokens, 6], Distribution::Normal(0.0, 1.0), device),
        }
    }

    fn options(max_steps: usize, min_steps: usize) -> DecodeOptions {
        DecodeOptions {
            max_steps,
            min_steps,
            stop_threshold: 0.5,
            stop_patience: 1,
        }
    }

    #[test]
    fn never_stopping_decoder_is_truncated() {
        let device = NdArrayDevice::default();
        let mut decoder = Decoder::<TestBackend>::init(&config(1, 3), &device);
        decoder.set_done_bias(-50.0, &device);
        let out = decoder
            .decode(&encoder_output(5, &device), None, &options(7, 1))
            .unwrap();
        assert_eq!(out.steps, 7);
        assert!(out.truncated);
        assert_eq!(out.mel.dims(), [14, 4]);
        assert_eq!(out.states.dims(), [7, 8]);
        assert_eq!(out.alignments.len(), 2);
        assert_eq!(out.alignments[0].steps, 7);
    }

    #[test]
    fn stop_waits_for_min_steps() {
        let device = NdArrayDevice::default();
        let mut decoder = Decoder::<TestBackend>::init(&config(1, 3), &device);
        decoder.set_done_bias(50.0, &device);
        let out = decoder
            .decode(&encoder_output(5, &device), None, &options(10, 3))
            .unwrap();
        assert_eq!(out.steps, 3);
        assert!(!out.truncated);
        assert!(out.done.iter().all(|p| *p > 0.5));
    }

    #[test]
    fn alignment_rows_respect_the_window_and_sum_to_one() {
        let device = NdArrayDevice::default();
        let mut decoder = Decoder::<TestBackend>::init(&config(1, 2), &device);
        decoder.set_done_bias(-50.0, &device);
        let tokens = 9;
        let out = decoder
            .decode(&encoder_output(tokens, &device), None, &options(12, 1))
            .unwrap();
        for matrix in &out.alignments {
            let mut focus = 0;
            for step in 0..matrix.steps {
                let row = matrix.row(step);
                let (start, end) = window_bounds(focus, 1, 2, tokens);
                for (i, w) in row.iter().enumerate() {
                    if i < start || i > end {
                        assert_eq!(*w, 0.0);
                    }
                }
                let total: f32 = row.iter().sum();
                assert!((total - 1.0).abs() < 1e-5);
                focus = crate::modules::attention::next_focus(row, FocusMode::ArgMax);
            }
        }
    }

    #[test]
    fn single_token_input_decodes() {
        let device = NdArrayDevice::default();
        let mut decoder = Decoder::<TestBackend>::init(&config(0, 0), &device);
        decoder.set_done_bias(-50.0, &device);
        let out = decoder
            .decode(&encoder_output(1, &device), None, &options(4, 1))
            .unwrap();
        for matrix in &out.alignments {
            assert!(matrix.data.iter().all(|w| *w == 1.0));
        }
        let mel = out.mel.to_data();
        assert!(mel.as_slice::<f32>().unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mean_focus_keeps_rows_inside_the_window() {
        let device = NdArrayDevice::default();
        let mut decoder = Decoder::<TestBackend>::init(&config(1, 2), &device);
        decoder.set_done_bias(-50.0, &device);
        decoder.set_focus_mode(FocusMode::Mean);
        let tokens = 7;
        let out = decoder
            .decode(&encoder_output(tokens, &device), None, &options(10, 1))
            .unwrap();
        for matrix in &out.alignments {
            let mut focus = 0;
            for step in 0..matrix.steps {
                let row = matrix.row(step);
                let (start, end) = window_bounds(focus, 1, 2, tokens);
                assert!(row[..start].iter().chain(&row[end + 1..]).all(|w| *w == 0.0));
                focus = crate::modules::attention::next_focus(row, FocusMode::Mean);
            }
        }
    }

    #[test]
    fn position_rates_apply_to_trainable_tables() {
        let device = NdArrayDevice::default();
        let mut cfg = config(1, 3);
        cfg.trainable_positions = Some(16);
        let mut decoder = Decoder::<TestBackend>::init(&cfg, &device);
        decoder.set_done_bias(-50.0, &device);
        let mut faster = decoder.clone();
        if let PositionEncoding::Table { rate, .. } = &mut faster.key_position {
            *rate = 7.0;
        }

        let encoded = encoder_output(5, &device);
        let mel = |d: &Decoder<TestBackend>| {
            let out = d.decode(&encoded, None, &options(6, 1)).unwrap();
            out.mel.to_data().as_slice::<f32>().unwrap().to_vec()
        };
        assert_ne!(mel(&decoder), mel(&faster));
    }

    #[test]
    fn trainable_positions_round_trip_through_store() {
        let device = NdArrayDevice::default();
        let mut cfg = config(1, 3);
        cfg.trainable_positions = Some(16);
        let decoder = Decoder::<TestBackend>::init(&cfg, &device);
        let mut store = ParamStore::new();
        decoder.export(&mut store, "decoder").unwrap();
        assert_eq!(
            store.get("decoder.query_position.weight").unwrap().shape,
            vec![16, 8]
        );
        let mut other = Decoder::<TestBackend>::init(&cfg, &device);
        other.load(&store, "decoder", &device).unwrap();
    }
}
