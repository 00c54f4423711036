//! # dv3 - Attention-windowed text-to-speech
//!
//! Inference for convolutional sequence-to-sequence TTS checkpoints in the
//! Deep Voice 3 family: text goes in, a waveform and an alignment plot come
//! out.
//!
//! ## Architecture Overview
//!
//! 1. **Text front-end** ([`frontend::EnglishFrontend`]): cleans English text
//!    and maps it to character (or, from a pronunciation dictionary, phoneme)
//!    ids, always ending in EOS.
//!
//! 2. **Encoder**: embeddings through non-causal gated convolutions into
//!    per-token attention keys and values.
//!
//! 3. **Decoder**: an autoregressive causal-convolution stack that emits `r`
//!    mel frames per step. Its attention layers only see a small window of
//!    tokens around a focus that advances with the alignment, and a stop head
//!    decides when the utterance is complete.
//!
//! 4. **Converter**: upsamples decoder output to a normalized linear
//!    spectrogram.
//!
//! 5. **Vocoder** ([`audio::Vocoder`]): denormalizes the spectrogram and
//!    recovers phase with Griffin-Lim.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use dv3::checkpoint::CheckpointSelector;
//! use dv3::runtime::{ExecutionContext, SynthesisRuntime};
//! use std::path::Path;
//!
//! let config = dv3::load_config("ljspeech.yaml").unwrap();
//! let context = ExecutionContext::<NdArray<f32>>::new(NdArrayDevice::default());
//! let output = Path::new("experiment");
//! let runtime =
//!     SynthesisRuntime::from_checkpoint(&config, &CheckpointSelector::Latest, output, context)
//!         .unwrap();
//! let report = runtime
//!     .synthesize_lines(&["Printing, in the only sense with which we are concerned."], output, None)
//!     .unwrap();
//! println!("wrote {}", report.written[0].wav.display());
//! ```

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod frontend;
pub mod perf;
pub mod plot;
pub mod runtime;

// Internal modules - exposed for integration tests but not part of stable API.
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod modules;
#[doc(hidden)]
pub mod state;
#[doc(hidden)]
pub mod weights;

pub use audio::{Spectrogram, Vocoder};
pub use config::{load_config, Config};
pub use error::Dv3Error;
pub use model::{Synthesis, TtsModel};
pub use runtime::{ExecutionContext, SynthesisRuntime};
