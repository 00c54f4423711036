//! Signal processing for the vocoder plus WAV file I/O.
//!
//! The model produces normalized linear spectrograms; everything from there to
//! PCM samples on disk lives here.

pub mod griffin_lim;
pub mod io;
pub mod spectrogram;
pub mod stft;

pub use spectrogram::{Spectrogram, SpectrogramTransform, Vocoder};
