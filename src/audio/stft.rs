//! Centred short-time Fourier transform and its overlap-add inverse.
//!
//! Frames are centred on multiples of the hop: the signal is reflect-padded by
//! `n_fft / 2` on both sides, so `len` samples give `1 + len / hop` frames. The
//! analysis window is a periodic Hann of `win_length` samples, zero-padded to
//! `n_fft` and centred.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// One-sided spectrum per frame, `frames × (1 + n_fft / 2)`.
pub type ComplexFrames = Vec<Vec<Complex<f64>>>;

pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f64>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for Stft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stft")
            .field("n_fft", &self.n_fft)
            .field("hop_length", &self.hop_length)
            .finish_non_exhaustive()
    }
}

impl Stft {
    pub fn new(n_fft: usize, win_length: usize, hop_length: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            n_fft,
            hop_length,
            window: padded_hann(win_length.min(n_fft), n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Frames produced for a signal of `len` samples.
    pub fn frame_count(&self, len: usize) -> usize {
        1 + len / self.hop_length
    }

    /// Samples an inverse of `frames` frames covers before trimming.
    pub fn natural_length(&self, frames: usize) -> usize {
        self.hop_length * frames.saturating_sub(1)
    }

    pub fn analyze(&self, signal: &[f64]) -> ComplexFrames {
        let pad = self.n_fft / 2;
        let padded = reflect_pad(signal, pad);
        let frames = self.frame_count(signal.len());
        let bins = self.bins();
        let mut out = Vec::with_capacity(frames);
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];
        for frame in 0..frames {
            let start = frame * self.hop_length;
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.forward.process(&mut buffer);
            out.push(buffer[..bins].to_vec());
        }
        out
    }

    /// Overlap-add inverse, normalized by the summed squared window.
    ///
    /// `length` trims or zero-pads the result; `None` keeps
    /// `hop · (frames - 1)` samples.
    pub fn synthesize(&self, frames: &[Vec<Complex<f64>>], length: Option<usize>) -> Vec<f64> {
        let n_fft = self.n_fft;
        let bins = self.bins();
        let total = n_fft + self.hop_length * frames.len().saturating_sub(1);
        let mut signal = vec![0.0f64; total];
        let mut window_sum = vec![0.0f64; total];
        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        let scale = 1.0 / n_fft as f64;

        for (index, spectrum) in frames.iter().enumerate() {
            // Rebuild the full Hermitian spectrum from the one-sided half.
            buffer[..bins].copy_from_slice(&spectrum[..bins]);
            for k in bins..n_fft {
                buffer[k] = spectrum[n_fft - k].conj();
            }
            self.inverse.process(&mut buffer);
            let start = index * self.hop_length;
            for i in 0..n_fft {
                let w = self.window[i];
                signal[start + i] += buffer[i].re * scale * w;
                window_sum[start + i] += w * w;
            }
        }
        for (sample, norm) in signal.iter_mut().zip(&window_sum) {
            if *norm > f64::MIN_POSITIVE {
                *sample /= norm;
            }
        }

        let start = n_fft / 2;
        let length = length.unwrap_or_else(|| self.natural_length(frames.len()));
        let mut out: Vec<f64> = signal.into_iter().skip(start).take(length).collect();
        out.resize(length, 0.0);
        out
    }
}

/// Periodic Hann window of `win_length`, centred in `n_fft` zeros.
fn padded_hann(win_length: usize, n_fft: usize) -> Vec<f64> {
    let offset = (n_fft - win_length) / 2;
    let mut window = vec![0.0; n_fft];
    for i in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[offset + i] = 0.5 * (1.0 - phase.cos());
    }
    window
}

/// Mirror `signal` by `pad` samples on both sides, without repeating the edge.
///
/// Signals shorter than the pad are reflected repeatedly.
fn reflect_pad(signal: &[f64], pad: usize) -> Vec<f64> {
    let len = signal.len();
    if len == 0 {
        return vec![0.0; 2 * pad];
    }
    if len == 1 {
        return vec![signal[0]; 2 * pad + 1];
    }
    let period = 2 * (len - 1) as isize;
    (0..len + 2 * pad)
        .map(|i| {
            let mut j = (i as isize - pad as isize).rem_euclid(period);
            if j >= len as isize {
                j = period - j;
            }
            signal[j as usize]
        })
        .collect()
}
