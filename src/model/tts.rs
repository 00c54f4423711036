//! End-to-end text-to-spectrogram model.
//!
//! [`TtsModel`] wires the encoder, the attentive decoder and the converter into
//! one interface. The vocoder is kept separate (see [`crate::audio::Vocoder`])
//! so spectrograms can be inspected or reused before audio is produced.

use crate::{
    audio::Spectrogram,
    config::Config,
    error::Dv3Error,
    frontend::{symbols, TokenSequence},
    model::{
        converter::Converter,
        decoder::{AttentionMatrix, DecodeOptions, Decoder, DecoderConfig},
        encoder::Encoder,
    },
    perf::{self, Metric},
    weights::{ParamStore, WeightNormLayer},
};
use anyhow::{anyhow, Result};
use burn::module::Param;
use burn::tensor::{backend::Backend, Distribution, Int, Tensor, TensorData};
use burn_nn::{Embedding, EmbeddingConfig};
use tracing::debug;

/// Result of synthesizing one token sequence, before vocoding.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Normalized linear spectrogram, `frames × (1 + n_fft / 2)`.
    pub linear: Spectrogram,
    /// Normalized mel spectrogram as predicted by the decoder.
    pub mel: Spectrogram,
    /// Attention of the last decoder attention layer.
    pub alignment: AttentionMatrix,
    pub steps: usize,
    pub truncated: bool,
}

/// The complete text-to-spectrogram network.
///
/// # Parameter layout
///
/// Parameters live under `speaker_embed.*`, `encoder.*`, `decoder.*` and
/// `converter.*`. Every linear layer and convolution is weight-normalized in
/// checkpoints (`weight_g` / `weight_v`); [`TtsModel::weight_norm_layers`]
/// enumerates them so a loader can fold them before
/// [`TtsModel::load_state_dict`].
#[derive(Debug, Clone)]
pub struct TtsModel<B: Backend> {
    pub speaker_embed: Option<Embedding<B>>,
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
    pub converter: Converter<B>,
    pub config: Config,
}

impl<B: Backend> TtsModel<B> {
    /// Build a randomly initialized model from a validated configuration.
    pub fn from_config(config: &Config, device: &B::Device) -> Self {
        let t = &config.transform;
        let m = &config.model;
        let speaker_dim = m.multi_speaker().then_some(m.speaker_embed_dim);

        let speaker_embed = speaker_dim.map(|dim| {
            let mut embed = EmbeddingConfig::new(m.n_speakers, dim).init::<B>(device);
            embed.weight = Param::from_tensor(Tensor::random(
                [m.n_speakers, dim],
                Distribution::Normal(0.0, m.speaker_embedding_weight_std as f64),
                device,
            ));
            embed
        });

        let encoder = Encoder::init(
            symbols::vocab_size(),
            m.text_embed_dim,
            m.encoder_channels,
            m.kernel_size,
            speaker_dim,
            m.embedding_weight_std,
            m.padding_idx,
            m.dropout,
            device,
        );

        let mut decoder = Decoder::init(
            &DecoderConfig {
                n_mels: t.n_mels,
                outputs_per_step: m.outputs_per_step,
                channels: m.decoder_channels,
                embed_dim: m.text_embed_dim,
                kernel_size: m.kernel_size,
                speaker_dim,
                dropout: m.dropout,
                query_position_rate: m.query_position_rate,
                key_position_rate: m.key_position_rate,
                trainable_positions: m
                    .trainable_positional_encodings
                    .then_some(m.max_positions),
                window_backward: m.window_backward,
                window_ahead: m.window_ahead,
                key_projection: m.key_projection,
                value_projection: m.value_projection,
            },
            device,
        );
        decoder.set_focus_mode(config.synthesis.focus);

        let converter_input = if m.use_decoder_state_for_postnet_input {
            m.decoder_channels / m.outputs_per_step
        } else {
            t.n_mels
        };
        let converter = Converter::init(
            converter_input,
            m.converter_channels,
            t.linear_dim(),
            m.downsample_factor,
            m.kernel_size,
            speaker_dim,
            m.dropout,
            device,
        );

        Self {
            speaker_embed,
            encoder,
            decoder,
            converter,
            config: config.clone(),
        }
    }

    /// Every weight-normalized layer, in the order parameters are stored.
    pub fn weight_norm_layers(&self) -> Vec<WeightNormLayer> {
        let mut layers = Vec::new();
        self.encoder.weight_norm_layers("encoder", &mut layers);
        self.decoder.weight_norm_layers("decoder", &mut layers);
        self.converter.weight_norm_layers("converter", &mut layers);
        layers
    }

    /// Copy parameters from a store whose weight norm is already folded.
    ///
    /// # Errors
    ///
    /// [`Dv3Error::Checkpoint`] if a parameter is missing or has the wrong shape.
    pub fn load_state_dict(&mut self, store: &ParamStore, device: &B::Device) -> Result<()> {
        if let Some(embed) = self.speaker_embed.as_mut() {
            let dims = embed.weight.val().dims();
            embed.weight =
                Param::from_tensor(store.tensor("speaker_embed.weight", dims, device)?);
        }
        self.encoder.load(store, "encoder", device)?;
        self.decoder.load(store, "decoder", device)?;
        self.converter.load(store, "converter", device)?;
        debug!(tensors = store.len(), "loaded state dict");
        Ok(())
    }

    /// Export parameters in folded form (plain `weight`).
    pub fn state_dict(&self) -> Result<ParamStore> {
        let mut store = ParamStore::new();
        if let Some(embed) = &self.speaker_embed {
            store.insert_tensor("speaker_embed.weight", embed.weight.val())?;
        }
        self.encoder.export(&mut store, "encoder")?;
        self.decoder.export(&mut store, "decoder")?;
        self.converter.export(&mut store, "converter")?;
        Ok(store)
    }

    /// Parameter count per top-level component, in storage order.
    pub fn param_summary(&self) -> Result<Vec<(&'static str, usize)>> {
        let store = self.state_dict()?;
        let count = |prefix: &str| -> usize {
            store
                .names()
                .filter(|name| name.split('.').next() == Some(prefix))
                .filter_map(|name| store.get(name))
                .map(|tensor| tensor.numel())
                .sum()
        };
        Ok(["speaker_embed", "encoder", "decoder", "converter"]
            .into_iter()
            .map(|prefix| (prefix, count(prefix)))
            .filter(|(_, n)| *n > 0)
            .collect())
    }

    /// Speaker embedding row `[1, speaker_embed_dim]`, or `None` for a
    /// single-speaker model.
    pub fn speaker(&self, speaker_id: usize, device: &B::Device) -> Result<Option<Tensor<B, 2>>> {
        let Some(embed) = &self.speaker_embed else {
            return Ok(None);
        };
        let n_speakers = self.config.model.n_speakers;
        if speaker_id >= n_speakers {
            return Err(Dv3Error::config(format!(
                "speaker id {speaker_id} out of range for {n_speakers} speakers"
            )));
        }
        let ids = Tensor::<B, 2, Int>::from_data(
            TensorData::new(vec![speaker_id as i64], [1, 1]),
            device,
        );
        let dim = self.config.model.speaker_embed_dim;
        Ok(Some(embed.forward(ids).reshape([1, dim])))
    }

    /// Text tokens to normalized spectrograms and alignment.
    ///
    /// # Errors
    ///
    /// [`Dv3Error::Frontend`] for token ids outside the vocabulary,
    /// [`Dv3Error::Config`] for an unknown speaker.
    pub fn synthesize(
        &self,
        tokens: &TokenSequence,
        speaker_id: usize,
        options: &DecodeOptions,
        device: &B::Device,
    ) -> Result<Synthesis> {
        let vocab = self.encoder.vocab_size() as i64;
        if let Some(bad) = tokens.ids().iter().find(|&&id| id < 0 || id >= vocab) {
            return Err(Dv3Error::Frontend(format!(
                "token id {bad} outside vocabulary of {vocab}"
            ))
            .into());
        }
        let speaker = self.speaker(speaker_id, device)?;

        let encoded = {
            let _span = perf::span(Metric::EncoderForward);
            self.encoder.encode(tokens, speaker.as_ref(), device)
        };
        let decoded = self.decoder.decode(&encoded, speaker.as_ref(), options)?;

        let m = &self.config.model;
        let converter_input = if m.use_decoder_state_for_postnet_input {
            let r = m.outputs_per_step;
            decoded
                .states
                .clone()
                .reshape([decoded.steps * r, m.decoder_channels / r])
        } else {
            decoded.mel.clone()
        };
        let linear = self.converter.forward(converter_input, speaker.as_ref())?;

        let alignment = decoded
            .alignments
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("decoder has no attention layers"))?;
        Ok(Synthesis {
            linear: Spectrogram::from_tensor(linear)?,
            mel: Spectrogram::from_tensor(decoded.mel)?,
            alignment,
            steps: decoded.steps,
            truncated: decoded.truncated,
        })
    }
}
