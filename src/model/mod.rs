//! The text-to-spectrogram network.
//!
//! `encoder` turns tokens into attention keys and values, `decoder` predicts mel
//! frames one step at a time, `converter` maps them to a linear spectrogram, and
//! `tts` ties the three together.

pub mod converter;
pub mod decoder;
pub mod encoder;
pub mod tts;

pub use tts::{Synthesis, TtsModel};
