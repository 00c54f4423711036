//! High-level synthesis runtime.
//!
//! [`SynthesisRuntime`] owns a loaded model, the text front-end and the
//! vocoder, and turns lines of text into `test_{idx}_step{iteration}.wav` and
//! `test_{idx}_step_{iteration}.png` pairs. Lines are independent: a failure
//! is logged and recorded, and the remaining lines are still attempted.

use crate::audio::io::{clip_samples, WavIo};
use crate::audio::Vocoder;
use crate::checkpoint::{load_checkpoint, CheckpointSelector};
use crate::config::Config;
use crate::frontend::{CmuDict, EnglishFrontend, TextFrontend};
use crate::model::decoder::{AttentionMatrix, DecodeOptions};
use crate::model::TtsModel;
use crate::perf::{self, Metric};
use crate::plot::save_alignment;
use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Directory under the output root that receives synthesized files.
pub const SYNTHESIS_DIR: &str = "synthesis";

/// Where tensors live for a run.
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// One synthesized line, before anything is written.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub waveform: Vec<f32>,
    pub alignment: AttentionMatrix,
    pub frames: usize,
    pub steps: usize,
    pub truncated: bool,
}

/// Files written for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtteranceReport {
    pub index: usize,
    pub wav: PathBuf,
    pub png: PathBuf,
    pub samples: usize,
    pub steps: usize,
    pub truncated: bool,
}

/// Outcome of a multi-line run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub written: Vec<UtteranceReport>,
    /// Line index and rendered error of every failed line.
    pub failed: Vec<(usize, String)>,
    /// The run stopped early on Ctrl-C.
    pub interrupted: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

/// WAV name for line `index` at checkpoint `iteration`.
pub fn wav_name(index: usize, iteration: u64) -> String {
    format!("test_{index}_step{iteration}.wav")
}

/// Alignment plot name for line `index` at checkpoint `iteration`.
pub fn png_name(index: usize, iteration: u64) -> String {
    format!("test_{index}_step_{iteration}.png")
}

pub struct SynthesisRuntime<B: Backend> {
    config: Config,
    model: TtsModel<B>,
    frontend: Box<dyn TextFrontend>,
    vocoder: Vocoder,
    iteration: u64,
    context: ExecutionContext<B>,
}

impl<B: Backend> std::fmt::Debug for SynthesisRuntime<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisRuntime")
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> SynthesisRuntime<B> {
    /// Build the model described by `config` and load the selected checkpoint
    /// from `output`.
    pub fn from_checkpoint(
        config: &Config,
        selector: &CheckpointSelector,
        output: &Path,
        context: ExecutionContext<B>,
    ) -> Result<Self> {
        let _span = perf::span(Metric::RuntimeFromCheckpoint);
        let mut model = TtsModel::from_config(config, &context.device);
        let checkpoint = load_checkpoint(selector, output, &model.weight_norm_layers())?;
        model
            .load_state_dict(&checkpoint.params, &context.device)
            .context("checkpoint does not match the configured model")?;
        Self::from_model(config, model, checkpoint.iteration, context)
    }

    /// Wrap an already-built model.
    pub fn from_model(
        config: &Config,
        model: TtsModel<B>,
        iteration: u64,
        context: ExecutionContext<B>,
    ) -> Result<Self> {
        let dict = config
            .frontend
            .cmudict_path
            .as_ref()
            .map(CmuDict::open)
            .transpose()?;
        if let Some(dict) = &dict {
            info!(entries = dict.len(), "loaded pronunciation dictionary");
        }
        let summary = model.param_summary()?;
        for &(component, params) in &summary {
            debug!(component, params, "model parameters");
        }
        info!(
            params = summary.iter().map(|(_, n)| n).sum::<usize>(),
            iteration,
            "model ready"
        );
        let frontend = EnglishFrontend::new(dict, config.transform.replace_pronunciation_prob);
        Ok(Self {
            config: config.clone(),
            model,
            frontend: Box::new(frontend),
            vocoder: Vocoder::from_config(config),
            iteration,
            context,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> &TtsModel<B> {
        &self.model
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Text to waveform for line `index`. The line index offsets the seed so
    /// each line has its own reproducible randomness.
    pub fn synthesize_text(&self, index: usize, text: &str) -> Result<Utterance> {
        let seed = self.config.synthesis.seed.wrapping_add(index as u64);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let tokens = {
            let _span = perf::span(Metric::FrontendEncode);
            self.frontend.encode(text, &mut rng)?
        };
        let options = DecodeOptions::from(&self.config.synthesis);
        let synthesis = self.model.synthesize(
            &tokens,
            self.config.synthesis.speaker_id,
            &options,
            &self.context.device,
        )?;
        if synthesis.truncated {
            warn!(index, steps = synthesis.steps, "utterance truncated at max decoder steps");
        }
        let mut waveform = self.vocoder.reconstruct(&synthesis.linear, seed)?;
        clip_samples(&mut waveform);
        Ok(Utterance {
            waveform,
            alignment: synthesis.alignment,
            frames: synthesis.linear.frames,
            steps: synthesis.steps,
            truncated: synthesis.truncated,
        })
    }

    fn write_utterance(&self, dir: &Path, index: usize, utterance: &Utterance) -> Result<UtteranceReport> {
        let wav = dir.join(wav_name(index, self.iteration));
        let png = dir.join(png_name(index, self.iteration));
        WavIo::write_mono(&wav, &utterance.waveform, self.config.transform.sample_rate)?;
        save_alignment(&utterance.alignment, &png)?;
        Ok(UtteranceReport {
            index,
            wav,
            png,
            samples: utterance.waveform.len(),
            steps: utterance.steps,
            truncated: utterance.truncated,
        })
    }

    /// Synthesize every line into `<output>/synthesis`, in order.
    ///
    /// Per-line failures are collected in the report; only failing to create
    /// the output directory is returned as an error.
    pub fn synthesize_lines<S: AsRef<str>>(
        &self,
        lines: &[S],
        output: &Path,
        interrupted: Option<&AtomicBool>,
    ) -> Result<BatchReport> {
        let dir = output.join(SYNTHESIS_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let mut report = BatchReport::default();

        for (index, line) in lines.iter().enumerate() {
            if interrupted.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                warn!(index, "interrupted, skipping remaining lines");
                report.interrupted = true;
                break;
            }
            perf::add_count(Metric::Utterances, 1);
            let result = self
                .synthesize_text(index, line.as_ref())
                .and_then(|utterance| self.write_utterance(&dir, index, &utterance));
            match result {
                Ok(written) => {
                    info!(
                        index,
                        wav = %written.wav.display(),
                        samples = written.samples,
                        steps = written.steps,
                        "synthesized"
                    );
                    report.written.push(written);
                }
                Err(err) => {
                    perf::add_count(Metric::FailedUtterances, 1);
                    error!(index, error = %format!("{err:#}"), "synthesis failed");
                    report.failed.push((index, format!("{err:#}")));
                }
            }
        }
        Ok(report)
    }

    /// Read `text_path` and synthesize each of its lines.
    pub fn synthesize_file(
        &self,
        text_path: &Path,
        output: &Path,
        interrupted: Option<&AtomicBool>,
    ) -> Result<BatchReport> {
        let text = fs::read_to_string(text_path)
            .with_context(|| format!("read {}", text_path.display()))?;
        let lines: Vec<&str> = text.lines().collect();
        self.synthesize_lines(&lines, output, interrupted)
    }
}
