//! Gated residual convolution block.

use crate::modules::streaming_conv::{Conv1d, StreamingConvState};
use crate::state::StreamingModule;
use crate::weights::{export_linear, linear_weight_norm, load_linear, ParamStore, WeightNormLayer};
use anyhow::Result;
use burn::tensor::{activation::sigmoid, backend::Backend, Tensor};
use burn_nn::{Linear, LinearConfig};

pub(crate) const RESIDUAL_SCALE: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// `x/(1+|x|)`
pub fn softsign<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let denom = x.clone().abs().add_scalar(1.0);
    x.div(denom)
}

/// Convolution to `2C` channels split into value and gate halves, an optional
/// speaker bias on the value half, and a scaled residual.
#[derive(Debug, Clone)]
pub struct GatedConvBlock<B: Backend> {
    pub conv: Conv1d<B>,
    pub speaker_proj: Option<Linear<B>>,
    pub channels: usize,
}

impl<B: Backend> GatedConvBlock<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        channels: usize,
        kernel_size: usize,
        dilation: usize,
        causal: bool,
        speaker_dim: Option<usize>,
        dropout: f32,
        device: &B::Device,
    ) -> Self {
        let std = (4.0 * (1.0 - dropout) / (kernel_size * channels) as f32).sqrt();
        let conv = Conv1d::init(
            channels,
            2 * channels,
            kernel_size,
            dilation,
            causal,
            std,
            device,
        );
        let speaker_proj =
            speaker_dim.map(|dim| LinearConfig::new(dim, channels).init::<B>(device));
        Self {
            conv,
            speaker_proj,
            channels,
        }
    }

    fn gate(&self, y: Tensor<B, 3>, residual: Tensor<B, 3>, speaker: Option<&Tensor<B, 2>>) -> Tensor<B, 3> {
        let c = self.channels;
        let value = y.clone().narrow(1, 0, c);
        let gate = y.narrow(1, c, c);
        let value = match (&self.speaker_proj, speaker) {
            (Some(proj), Some(embedding)) => {
                let bias = softsign(proj.forward(embedding.clone()));
                value + bias.reshape([1, c, 1])
            }
            _ => value,
        };
        (value * sigmoid(gate) + residual).mul_scalar(RESIDUAL_SCALE)
    }

    /// `[1, C, T] → [1, C, T]`.
    pub fn forward(&self, x: Tensor<B, 3>, speaker: Option<&Tensor<B, 2>>) -> Tensor<B, 3> {
        let y = self.conv.forward(x.clone());
        self.gate(y, x, speaker)
    }

    /// One frame `[1, C, 1]` through a causal block.
    pub fn step(
        &self,
        state: &mut StreamingConvState<B>,
        x: Tensor<B, 3>,
        speaker: Option<&Tensor<B, 2>>,
    ) -> Tensor<B, 3> {
        let y = self.conv.step(state, x.clone());
        self.gate(y, x, speaker)
    }

    pub fn load(&mut self, store: &ParamStore, prefix: &str, device: &B::Device) -> Result<()> {
        self.conv.load(store, &format!("{prefix}.conv"), device)?;
        if let Some(proj) = self.speaker_proj.as_mut() {
            load_linear(proj, store, &format!("{prefix}.speaker_proj"), device)?;
        }
        Ok(())
    }

    pub fn export(&self, store: &mut ParamStore, prefix: &str) -> Result<()> {
        self.conv.export(store, &format!("{prefix}.conv"))?;
        if let Some(proj) = &self.speaker_proj {
            export_linear(proj, store, &format!("{prefix}.speaker_proj"))?;
        }
        Ok(())
    }

    pub fn weight_norm_layers(&self, prefix: &str, out: &mut Vec<WeightNormLayer>) {
        out.push(Conv1d::<B>::weight_norm_layer(&format!("{prefix}.conv")));
        if self.speaker_proj.is_some() {
            out.push(linear_weight_norm(&format!("{prefix}.speaker_proj")));
        }
    }
}

impl<B: Backend> StreamingModule<B> for GatedConvBlock<B> {
    type State = StreamingConvState<B>;

    fn init_state(&self, device: &B::Device) -> Self::State {
        self.conv.init_state(device)
    }
}
