//! Single-query dot-product attention restricted to a moving window of tokens.
//!
//! Each decoder step attends only to tokens in
//! `[focus - window_backward, focus + window_ahead] ∩ [0, T - 1]`. Scores outside
//! the window are set to `-inf` before the softmax, so their weights are exactly
//! zero. After the step the focus moves to where the attention landed.

use crate::config::FocusMode;
use crate::modules::conv_block::RESIDUAL_SCALE;
use crate::weights::{export_linear, linear_weight_norm, load_linear, ParamStore, WeightNormLayer};
use anyhow::{anyhow, Result};
use burn::tensor::{activation::softmax, backend::Backend, Bool, Tensor, TensorData};
use burn_nn::{Linear, LinearConfig};

/// Attention focus of one layer. Starts at token 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttentionState {
    pub focus: usize,
}

/// Inclusive `(start, end)` of the attendable tokens.
pub fn window_bounds(focus: usize, backward: usize, ahead: usize, tokens: usize) -> (usize, usize) {
    let last = tokens.saturating_sub(1);
    let focus = focus.min(last);
    (focus.saturating_sub(backward), (focus + ahead).min(last))
}

/// `true` for tokens outside the window.
pub fn window_mask(focus: usize, backward: usize, ahead: usize, tokens: usize) -> Vec<bool> {
    let (start, end) = window_bounds(focus, backward, ahead, tokens);
    (0..tokens).map(|i| i < start || i > end).collect()
}

/// New focus from one step's weights, clipped to the token range.
pub fn next_focus(weights: &[f32], mode: FocusMode) -> usize {
    let last = weights.len().saturating_sub(1);
    let focus = match mode {
        FocusMode::ArgMax => {
            let mut best = 0;
            for (i, w) in weights.iter().enumerate() {
                if *w > weights[best] {
                    best = i;
                }
            }
            best
        }
        FocusMode::Mean => {
            let mean: f32 = weights.iter().enumerate().map(|(i, w)| i as f32 * w).sum();
            if mean.is_finite() {
                mean.round().max(0.0) as usize
            } else {
                0
            }
        }
    };
    focus.min(last)
}

/// Projected encoder outputs, computed once per utterance.
#[derive(Debug, Clone)]
pub struct AttentionMemory<B: Backend> {
    /// `[E, T]`
    pub keys_t: Tensor<B, 2>,
    /// `[T, E]`
    pub values: Tensor<B, 2>,
    pub tokens: usize,
}

#[derive(Debug, Clone)]
pub struct WindowedAttention<B: Backend> {
    pub query_proj: Linear<B>,
    pub key_proj: Option<Linear<B>>,
    pub value_proj: Option<Linear<B>>,
    pub out_proj: Linear<B>,
    pub window_backward: usize,
    pub window_ahead: usize,
    pub focus_mode: FocusMode,
}

impl<B: Backend> WindowedAttention<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        channels: usize,
        embed_dim: usize,
        key_projection: bool,
        value_projection: bool,
        window_backward: usize,
        window_ahead: usize,
        device: &B::Device,
    ) -> Self {
        let square = || LinearConfig::new(embed_dim, embed_dim).init::<B>(device);
        Self {
            query_proj: LinearConfig::new(channels, embed_dim).init(device),
            key_proj: key_projection.then(square),
            value_proj: value_projection.then(square),
            out_proj: LinearConfig::new(embed_dim, channels).init(device),
            window_backward,
            window_ahead,
            focus_mode: FocusMode::default(),
        }
    }

    /// Project keys (with their position rows added) and values.
    pub fn prepare(
        &self,
        keys: Tensor<B, 2>,
        values: Tensor<B, 2>,
        key_positions: Tensor<B, 2>,
    ) -> AttentionMemory<B> {
        let tokens = keys.dims()[0];
        let keys = keys + key_positions;
        let keys = match &self.key_proj {
            Some(proj) => proj.forward(keys),
            None => keys,
        };
        let values = match &self.value_proj {
            Some(proj) => proj.forward(values),
            None => values,
        };
        AttentionMemory {
            keys_t: keys.transpose(),
            values,
            tokens,
        }
    }

    /// Attend with `query` `[1, C]` (position already added).
    ///
    /// Returns the residual output `[1, C]` and the weights over all tokens.
    pub fn step(
        &self,
        state: &mut AttentionState,
        memory: &AttentionMemory<B>,
        query: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 2>, Vec<f32>)> {
        let device = query.device();
        let tokens = memory.tokens;
        let scores = self.query_proj.forward(query.clone()).matmul(memory.keys_t.clone());

        let mask = window_mask(state.focus, self.window_backward, self.window_ahead, tokens);
        let mask = Tensor::<B, 2, Bool>::from_data(TensorData::new(mask, [1, tokens]), &device);
        let weights = softmax(scores.mask_fill(mask, f32::NEG_INFINITY), 1);

        let context = weights
            .clone()
            .matmul(memory.values.clone())
            .mul_scalar((tokens as f32).sqrt());
        let out = (self.out_proj.forward(context) + query).mul_scalar(RESIDUAL_SCALE);

        let weights = weights
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("read attention weights: {e:?}"))?;
        state.focus = next_focus(&weights, self.focus_mode);
        Ok((out, weights))
    }

    pub fn load(&mut self, store: &ParamStore, prefix: &str, device: &B::Device) -> Result<()> {
        load_linear(&mut self.query_proj, store, &format!("{prefix}.query_proj"), device)?;
        if let Some(proj) = self.key_proj.as_mut() {
            load_linear(proj, store, &format!("{prefix}.key_proj"), device)?;
        }
        if let Some(proj) = self.value_proj.as_mut() {
            load_linear(proj, store, &format!("{prefix}.value_proj"), device)?;
        }
        load_linear(&mut self.out_proj, store, &format!("{prefix}.out_proj"), device)
    }

    pub fn export(&self, store: &mut ParamStore, prefix: &str) -> Result<()> {
        export_linear(&self.query_proj, store, &format!("{prefix}.query_proj"))?;
        if let Some(proj) = &self.key_proj {
            export_linear(proj, store, &format!("{prefix}.key_proj"))?;
        }
        if let Some(proj) = &self.value_proj {
            export_linear(proj, store, &format!("{prefix}.value_proj"))?;
        }
        export_linear(&self.out_proj, store, &format!("{prefix}.out_proj"))
    }

    pub fn weight_norm_layers(&self, prefix: &str, out: &mut Vec<WeightNormLayer>) {
        out.push(linear_weight_norm(&format!("{prefix}.query_proj")));
        if self.key_proj.is_some() {
            out.push(linear_weight_norm(&format!("{prefix}.key_proj")));
        }
        if self.value_proj.is_some() {
            out.push(linear_weight_norm(&format!("{prefix}.value_proj")));
        }
        out.push(linear_weight_norm(&format!("{prefix}.out_proj")));
    }
}
