//! Converter: decoder output to a normalized linear-frequency spectrogram.

use crate::modules::conv_block::GatedConvBlock;
use crate::modules::streaming_conv::ConvTranspose1d;
use crate::perf::{self, Metric};
use crate::weights::{
    export_linear, linear_weight_norm, load_linear, ParamStore, WeightNormLayer,
};
use anyhow::{ensure, Result};
use burn::tensor::{activation::sigmoid, backend::Backend, Tensor};
use burn_nn::{Linear, LinearConfig};

/// Dilations of the non-causal converter blocks.
pub const CONVERTER_DILATIONS: [usize; 4] = [1, 3, 1, 3];

#[derive(Debug, Clone)]
pub struct Converter<B: Backend> {
    pub in_proj: Linear<B>,
    /// One ×2 stage per factor of two in the downsample factor.
    pub upsample: Vec<ConvTranspose1d<B>>,
    pub blocks: Vec<GatedConvBlock<B>>,
    pub out_proj: Linear<B>,
    pub input_dim: usize,
    pub linear_dim: usize,
}

impl<B: Backend> Converter<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        input_dim: usize,
        channels: usize,
        linear_dim: usize,
        downsample_factor: usize,
        kernel_size: usize,
        speaker_dim: Option<usize>,
        dropout: f32,
        device: &B::Device,
    ) -> Self {
        let stages = downsample_factor.trailing_zeros() as usize;
        let up_std = (4.0 * (1.0 - dropout) / (2 * channels) as f32).sqrt();
        Self {
            in_proj: LinearConfig::new(input_dim, channels).init(device),
            upsample: (0..stages)
                .map(|_| ConvTranspose1d::init(channels, channels, 2, 2, up_std, device))
                .collect(),
            blocks: CONVERTER_DILATIONS
                .iter()
                .map(|&d| {
                    GatedConvBlock::init(channels, kernel_size, d, false, speaker_dim, dropout, device)
                })
                .collect(),
            out_proj: LinearConfig::new(channels, linear_dim).init(device),
            input_dim,
            linear_dim,
        }
    }

    pub fn upsample_factor(&self) -> usize {
        1 << self.upsample.len()
    }

    /// `[N, input_dim] → [N · downsample_factor, linear_dim]` in `[0, 1]`.
    pub fn forward(&self, input: Tensor<B, 2>, speaker: Option<&Tensor<B, 2>>) -> Result<Tensor<B, 2>> {
        let _span = perf::span(Metric::ConverterForward);
        let [frames, dim] = input.dims();
        ensure!(
            dim == self.input_dim,
            "converter expects {} input channels, got {dim}",
            self.input_dim
        );
        let mut x = self
            .in_proj
            .forward(input.unsqueeze_dim::<3>(0))
            .swap_dims(1, 2);
        for stage in &self.upsample {
            x = stage.forward(x);
        }
        for block in &self.blocks {
            x = block.forward(x, speaker);
        }
        let out = sigmoid(self.out_proj.forward(x.swap_dims(1, 2)));
        let out_frames = frames * self.upsample_factor();
        Ok(out.reshape([out_frames, self.linear_dim]))
    }

    pub fn load(&mut self, store: &ParamStore, prefix: &str, device: &B::Device) -> Result<()> {
        load_linear(&mut self.in_proj, store, &format!("{prefix}.in_proj"), device)?;
        for (i, stage) in self.upsample.iter_mut().enumerate() {
            stage.load(store, &format!("{prefix}.upsample.{i}"), device)?;
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.load(store, &format!("{prefix}.blocks.{i}"), device)?;
        }
        load_linear(&mut self.out_proj, store, &format!("{prefix}.out_proj"), device)
    }

    pub fn export(&self, store: &mut ParamStore, prefix: &str) -> Result<()> {
        export_linear(&self.in_proj, store, &format!("{prefix}.in_proj"))?;
        for (i, stage) in self.upsample.iter().enumerate() {
            stage.export(store, &format!("{prefix}.upsample.{i}"))?;
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.export(store, &format!("{prefix}.blocks.{i}"))?;
        }
        export_linear(&self.out_proj, store, &format!("{prefix}.out_proj"))
    }

    pub fn weight_norm_layers(&self, prefix: &str, out: &mut Vec<WeightNormLayer>) {
        out.push(linear_weight_norm(&format!("{prefix}.in_proj")));
        for i in 0..self.upsample.len() {
            out.push(ConvTranspose1d::<B>::weight_norm_layer(&format!("{prefix}.upsample.{i}")));
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.weight_norm_layers(&format!("{prefix}.blocks.{i}"), out);
        }
        out.push(linear_weight_norm(&format!("{prefix}.out_proj")));
    }
}
