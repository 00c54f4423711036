//! Dilated 1D convolutions in full-sequence and frame-by-frame form.
//!
//! A causal convolution keeps the last `(kernel - 1) · dilation` input frames as
//! history so that feeding frames one at a time produces the same outputs as
//! running over the whole sequence with left zero padding.

use crate::state::StreamingModule;
use crate::weights::{ParamStore, WeightNormLayer};
use anyhow::Result;
use burn::tensor::{
    backend::Backend,
    module::{conv1d, conv_transpose1d},
    ops::{ConvOptions, ConvTransposeOptions},
    Distribution, Tensor,
};

/// History buffer of a causal convolution.
#[derive(Debug, Clone)]
pub struct StreamingConvState<B: Backend> {
    /// Last `(kernel - 1) · dilation` input frames, `[1, in, len]`.
    pub history: Option<Tensor<B, 3>>,
}

/// Dilated stride-1 convolution over `[batch, channels, time]`.
#[derive(Debug, Clone)]
pub struct Conv1d<B: Backend> {
    /// `[out, in, kernel]`.
    pub weight: Tensor<B, 3>,
    /// `[out]`.
    pub bias: Tensor<B, 1>,
    pub dilation: usize,
    /// Causal convs see only current and past frames; others are centred.
    pub causal: bool,
}

impl<B: Backend> Conv1d<B> {
    pub fn new(weight: Tensor<B, 3>, bias: Tensor<B, 1>, dilation: usize, causal: bool) -> Self {
        Self {
            weight,
            bias,
            dilation,
            causal,
        }
    }

    /// Normal-initialized weights, zero bias.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        causal: bool,
        std: f32,
        device: &B::Device,
    ) -> Self {
        let weight = Tensor::random(
            [out_channels, in_channels, kernel_size],
            Distribution::Normal(0.0, std as f64),
            device,
        );
        let bias = Tensor::zeros([out_channels], device);
        Self::new(weight, bias, dilation, causal)
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dims()[2]
    }

    /// Frames of past context the kernel spans.
    pub fn receptive_history(&self) -> usize {
        (self.kernel_size() - 1) * self.dilation
    }

    fn options(&self) -> ConvOptions<1> {
        ConvOptions::new([1], [0], [self.dilation], 1)
    }

    /// Whole-sequence convolution. Output length equals input length.
    ///
    /// Padding is applied as explicit zeros; the kernel itself runs unpadded.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let history = self.receptive_history();
        let (left, right) = if self.causal {
            (history, 0)
        } else {
            let half = (self.kernel_size() - 1) / 2 * self.dilation;
            (half, history - half)
        };
        conv1d(
            zero_pad(input, left, right),
            self.weight.clone(),
            Some(self.bias.clone()),
            self.options(),
        )
    }

    /// Convolve new frames `[1, in, n]` against the stored history.
    ///
    /// Only meaningful for causal convolutions.
    pub fn step(&self, state: &mut StreamingConvState<B>, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let keep = self.receptive_history();
        let extended = match state.history.take() {
            Some(history) => Tensor::cat(vec![history, input], 2),
            None => input,
        };
        let output = conv1d(
            extended.clone(),
            self.weight.clone(),
            Some(self.bias.clone()),
            self.options(),
        );
        if keep > 0 {
            let len = extended.dims()[2];
            state.history = Some(extended.narrow(2, len - keep, keep));
        }
        output
    }

    pub fn load(&mut self, store: &ParamStore, prefix: &str, device: &B::Device) -> Result<()> {
        let dims = self.weight.dims();
        self.weight = store.tensor(&format!("{prefix}.weight"), dims, device)?;
        self.bias = store.tensor(&format!("{prefix}.bias"), [dims[0]], device)?;
        Ok(())
    }

    pub fn export(&self, store: &mut ParamStore, prefix: &str) -> Result<()> {
        store.insert_tensor(format!("{prefix}.weight"), self.weight.clone())?;
        store.insert_tensor(format!("{prefix}.bias"), self.bias.clone())
    }

    /// Output channels are normalized independently.
    pub fn weight_norm_layer(prefix: &str) -> WeightNormLayer {
        WeightNormLayer::new(prefix, 0)
    }
}

impl<B: Backend> StreamingModule<B> for Conv1d<B> {
    type State = StreamingConvState<B>;

    /// History starts as zeros, matching the left padding of [`Conv1d::forward`].
    fn init_state(&self, device: &B::Device) -> Self::State {
        let keep = self.receptive_history();
        let history = (keep > 0).then(|| Tensor::zeros([1, self.in_channels(), keep], device));
        StreamingConvState { history }
    }
}

/// Zero-pad the time axis of `[b, c, t]`.
fn zero_pad<B: Backend>(input: Tensor<B, 3>, left: usize, right: usize) -> Tensor<B, 3> {
    if left == 0 && right == 0 {
        return input;
    }
    let [batch, channels, _] = input.dims();
    let device = input.device();
    let mut parts = Vec::with_capacity(3);
    if left > 0 {
        parts.push(Tensor::zeros([batch, channels, left], &device));
    }
    parts.push(input);
    if right > 0 {
        parts.push(Tensor::zeros([batch, channels, right], &device));
    }
    Tensor::cat(parts, 2)
}

/// Transposed convolution used for time upsampling.
#[derive(Debug, Clone)]
pub struct ConvTranspose1d<B: Backend> {
    /// `[in, out, kernel]`.
    pub weight: Tensor<B, 3>,
    /// `[out]`.
    pub bias: Tensor<B, 1>,
    pub stride: usize,
}

impl<B: Backend> ConvTranspose1d<B> {
    pub fn init(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        std: f32,
        device: &B::Device,
    ) -> Self {
        let weight = Tensor::random(
            [in_channels, out_channels, kernel_size],
            Distribution::Normal(0.0, std as f64),
            device,
        );
        Self {
            weight,
            bias: Tensor::zeros([out_channels], device),
            stride,
        }
    }

    /// `[b, in, t] → [b, out, (t - 1) · stride + kernel]`.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        conv_transpose1d(
            input,
            self.weight.clone(),
            Some(self.bias.clone()),
            ConvTransposeOptions::new([self.stride], [0], [0], [1], 1),
        )
    }

    pub fn load(&mut self, store: &ParamStore, prefix: &str, device: &B::Device) -> Result<()> {
        let dims = self.weight.dims();
        self.weight = store.tensor(&format!("{prefix}.weight"), dims, device)?;
        self.bias = store.tensor(&format!("{prefix}.bias"), [dims[1]], device)?;
        Ok(())
    }

    pub fn export(&self, store: &mut ParamStore, prefix: &str) -> Result<()> {
        store.insert_tensor(format!("{prefix}.weight"), self.weight.clone())?;
        store.insert_tensor(format!("{prefix}.bias"), self.bias.clone())
    }

    /// Normalized per input channel (the leading axis of `[in, out, kernel]`).
    pub fn weight_norm_layer(prefix: &str) -> WeightNormLayer {
        WeightNormLayer::new(prefix, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn values(t: Tensor<TestBackend, 3>) -> Vec<f32> {
        t.to_data().as_slice::<f32>().unwrap().to_vec()
    }

    #[test]
    fn causal_forward_only_looks_back() {
        let device = NdArrayDevice::default();
        // y[t] = x[t - 2] + 10 · x[t]
        let weight = Tensor::<TestBackend, 3>::from_floats([[[1.0, 10.0]]], &device);
        let bias = Tensor::<TestBackend, 1>::from_floats([0.0], &device);
        let conv = Conv1d::new(weight, bias, 2, true);
        let input = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0, 3.0, 4.0]]], &device);
        assert_eq!(values(conv.forward(input)), vec![10.0, 20.0, 31.0, 42.0]);
    }

    #[test]
    fn non_causal_forward_is_centred() {
        let device = NdArrayDevice::default();
        let weight = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, -1.0]]], &device);
        let bias = Tensor::<TestBackend, 1>::from_floats([0.5], &device);
        let conv = Conv1d::new(weight, bias, 1, false);
        let input = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0, 4.0]]], &device);
        assert_eq!(values(conv.forward(input)), vec![-1.5, -2.5, 2.5]);
    }

    #[test]
    fn dilation_wider_than_the_sequence_only_sees_the_centre_tap() {
        let device = NdArrayDevice::default();
        let conv = Conv1d::new(
            Tensor::<TestBackend, 3>::ones([32, 16, 3], &device),
            Tensor::<TestBackend, 1>::zeros([32], &device),
            27,
            false,
        );
        let output = conv.forward(Tensor::<TestBackend, 3>::ones([1, 16, 10], &device));
        assert_eq!(output.dims(), [1, 32, 10]);
        assert!(values(output).iter().all(|v| (*v - 16.0).abs() < 1e-5));
    }

    #[test]
    fn causal_dilation_wider_than_the_sequence_keeps_length() {
        let device = NdArrayDevice::default();
        let conv = Conv1d::<TestBackend>::init(4, 4, 3, 27, true, 0.5, &device);
        let input = Tensor::<TestBackend, 3>::random(
            [1, 4, 2],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        assert_eq!(conv.forward(input).dims(), [1, 4, 2]);
    }

    #[test]
    fn incremental_matches_full_sequence() {
        let device = NdArrayDevice::default();
        let conv = Conv1d::<TestBackend>::init(3, 4, 3, 3, true, 0.5, &device);
        let input = Tensor::<TestBackend, 3>::random(
            [1, 3, 9],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let full = values(conv.forward(input.clone()));

        let mut state = conv.init_state(&device);
        let mut frames = Vec::new();
        for t in 0..9 {
            frames.push(conv.step(&mut state, input.clone().narrow(2, t, 1)));
        }
        let stepped = values(Tensor::cat(frames, 2));
        for (a, b) in full.iter().zip(&stepped) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn transpose_doubles_length() {
        let device = NdArrayDevice::default();
        let up = ConvTranspose1d {
            weight: Tensor::<TestBackend, 3>::from_data(
                TensorData::new(vec![1.0f32, 2.0], [1, 1, 2]),
                &device,
            ),
            bias: Tensor::<TestBackend, 1>::from_floats([0.0], &device),
            stride: 2,
        };
        let input = Tensor::<TestBackend, 3>::from_floats([[[1.0, 3.0]]], &device);
        assert_eq!(values(up.forward(input)), vec![1.0, 2.0, 3.0, 6.0]);
    }
}
