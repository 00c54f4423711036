//! Text encoder: token embeddings to attention keys and values.

use crate::frontend::TokenSequence;
use crate::modules::conv_block::{softsign, GatedConvBlock, RESIDUAL_SCALE};
use crate::weights::{export_linear, linear_weight_norm, load_linear, ParamStore, WeightNormLayer};
use anyhow::Result;
use burn::module::Param;
use burn::tensor::{backend::Backend, s, Distribution, Int, Tensor, TensorData};
use burn_nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};

/// Dilations of the non-causal encoder blocks.
pub const ENCODER_DILATIONS: [usize; 10] = [1, 3, 9, 27, 1, 3, 9, 27, 1, 3];

/// Keys and values for every token, both `[T, text_embed_dim]`.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    pub keys: Tensor<B, 2>,
    pub values: Tensor<B, 2>,
}

impl<B: Backend> EncoderOutput<B> {
    pub fn tokens(&self) -> usize {
        self.keys.dims()[0]
    }
}

#[derive(Debug, Clone)]
pub struct Encoder<B: Backend> {
    pub embed: Embedding<B>,
    pub speaker_proj: Option<Linear<B>>,
    pub in_proj: Linear<B>,
    pub blocks: Vec<GatedConvBlock<B>>,
    pub out_proj: Linear<B>,
}

impl<B: Backend> Encoder<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        vocab_size: usize,
        embed_dim: usize,
        channels: usize,
        kernel_size: usize,
        speaker_dim: Option<usize>,
        embedding_std: f32,
        padding_idx: usize,
        dropout: f32,
        device: &B::Device,
    ) -> Self {
        let mut embed = EmbeddingConfig::new(vocab_size, embed_dim).init::<B>(device);
        let mut table = Tensor::<B, 2>::random(
            [vocab_size, embed_dim],
            Distribution::Normal(0.0, embedding_std as f64),
            device,
        );
        if padding_idx < vocab_size {
            table = table.slice_assign(
                s![padding_idx..padding_idx + 1, ..],
                Tensor::zeros([1, embed_dim], device),
            );
        }
        embed.weight = Param::from_tensor(table);

        let blocks = ENCODER_DILATIONS
            .iter()
            .map(|&d| {
                GatedConvBlock::init(channels, kernel_size, d, false, speaker_dim, dropout, device)
            })
            .collect();
        Self {
            embed,
            speaker_proj: speaker_dim.map(|s| LinearConfig::new(s, embed_dim).init(device)),
            in_proj: LinearConfig::new(embed_dim, channels).init(device),
            blocks,
            out_proj: LinearConfig::new(channels, embed_dim).init(device),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.embed.weight.val().dims()[0]
    }

    pub fn embed_dim(&self) -> usize {
        self.embed.weight.val().dims()[1]
    }

    /// Encode one utterance. `speaker` is `[1, speaker_embed_dim]`.
    pub fn forward(
        &self,
        tokens: &TokenSequence,
        speaker: Option<&Tensor<B, 2>>,
        device: &B::Device,
    ) -> Tensor<B, 3> {
        let ids = Tensor::<B, 2, Int>::from_data(
            TensorData::new(tokens.ids().to_vec(), [1, tokens.len()]),
            device,
        );
        // [1, T, E]
        let mut embedded = self.embed.forward(ids);
        if let (Some(proj), Some(speaker)) = (&self.speaker_proj, speaker) {
            let bias = softsign(proj.forward(speaker.clone()));
            embedded = embedded + bias.unsqueeze_dim::<3>(1);
        }
        embedded
    }

    /// Full encoder pass.
    pub fn encode(
        &self,
        tokens: &TokenSequence,
        speaker: Option<&Tensor<B, 2>>,
        device: &B::Device,
    ) -> EncoderOutput<B> {
        let embedded = self.forward(tokens, speaker, device);
        let mut x = self.in_proj.forward(embedded.clone()).swap_dims(1, 2);
        for block in &self.blocks {
            x = block.forward(x, speaker);
        }
        let keys = self.out_proj.forward(x.swap_dims(1, 2));
        let values = (keys.clone() + embedded).mul_scalar(RESIDUAL_SCALE);
        let [_, tokens, dim] = keys.dims();
        EncoderOutput {
            keys: keys.reshape([tokens, dim]),
            values: values.reshape([tokens, dim]),
        }
    }

    pub fn load(&mut self, store: &ParamStore, prefix: &str, device: &B::Device) -> Result<()> {
        let dims = self.embed.weight.val().dims();
        self.embed.weight =
            Param::from_tensor(store.tensor(&format!("{prefix}.embed.weight"), dims, device)?);
        if let Some(proj) = self.speaker_proj.as_mut() {
            load_linear(proj, store, &format!("{prefix}.speaker_proj"), device)?;
        }
        load_linear(&mut self.in_proj, store, &format!("{prefix}.in_proj"), device)?;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.load(store, &format!("{prefix}.blocks.{i}"), device)?;
        }
        load_linear(&mut self.out_proj, store, &format!("{prefix}.out_proj"), device)
    }

    pub fn export(&self, store: &mut ParamStore, prefix: &str) -> Result<()> {
        store.insert_tensor(format!("{prefix}.embed.weight"), self.embed.weight.val())?;
        if let Some(proj) = &self.speaker_proj {
            export_linear(proj, store, &format!("{prefix}.speaker_proj"))?;
        }
        export_linear(&self.in_proj, store, &format!("{prefix}.in_proj"))?;
        for (i, block) in self.blocks.iter().enumerate() {
            block.export(store, &format!("{prefix}.blocks.{i}"))?;
        }
        export_linear(&self.out_proj, store, &format!("{prefix}.out_proj"))
    }

    pub fn weight_norm_layers(&self, prefix: &str, out: &mut Vec<WeightNormLayer>) {
        if self.speaker_proj.is_some() {
            out.push(linear_weight_norm(&format!("{prefix}.speaker_proj")));
        }
        out.push(linear_weight_norm(&format!("{prefix}.in_proj")));
        for (i, block) in self.blocks.iter().enumerate() {
            block.weight_norm_layers(&format!("{prefix}.blocks.{i}"), out);
        }
        out.push(linear_weight_norm(&format!("{prefix}.out_proj")));
    }
}
