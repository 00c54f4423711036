//! Griffin-Lim phase reconstruction with optional momentum.
//!
//! With `momentum = 0` this is the classic alternating projection; with
//! `momentum > 0` it is the accelerated ("fast") variant, where each rebuilt
//! spectrum is pushed away from the previous one by `momentum / (1 + momentum)`.

use super::stft::{ComplexFrames, Stft};
use crate::config::PhaseInit;
use crate::perf::{self, Metric};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rustfft::num_complex::Complex;

#[derive(Debug)]
pub struct GriffinLim {
    stft: Stft,
    n_iter: usize,
    momentum: f64,
    phase_init: PhaseInit,
}

impl GriffinLim {
    pub fn new(stft: Stft, n_iter: usize, momentum: f32, phase_init: PhaseInit) -> Self {
        Self {
            stft,
            n_iter,
            momentum: momentum as f64,
            phase_init,
        }
    }

    pub fn stft(&self) -> &Stft {
        &self.stft
    }

    /// Estimate a signal whose STFT magnitude matches `magnitude`
    /// (`frames × bins`). The result has `length` samples, or the natural
    /// `hop · (frames - 1)` when `None`.
    pub fn reconstruct(
        &self,
        magnitude: &[Vec<f64>],
        rng: &mut ChaCha8Rng,
        length: Option<usize>,
    ) -> Vec<f64> {
        let mut angles: ComplexFrames = magnitude
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&m| match self.phase_init {
                        PhaseInit::Random => {
                            let phase = 2.0 * std::f64::consts::PI * rng.random::<f64>();
                            Complex::from_polar(m, phase)
                        }
                        PhaseInit::Zeros => Complex::new(m, 0.0),
                    })
                    .collect()
            })
            .collect();

        let accel = self.momentum / (1.0 + self.momentum);
        let mut previous: Option<ComplexFrames> = None;
        for _ in 0..self.n_iter {
            let _span = perf::span(Metric::GriffinLimIteration);
            let inverse = self.stft.synthesize(&angles, None);
            let rebuilt = self.stft.analyze(&inverse);
            for (f, row) in rebuilt.iter().enumerate() {
                for (k, value) in row.iter().enumerate() {
                    let mut z = *value;
                    if let Some(prev) = &previous {
                        z -= prev[f][k] * accel;
                    }
                    let norm = z.norm() + f64::MIN_POSITIVE;
                    angles[f][k] = z / norm * magnitude[f][k];
                }
            }
            previous = Some(rebuilt);
        }
        self.stft.synthesize(&angles, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn magnitude_of(stft: &Stft, signal: &[f64]) -> Vec<Vec<f64>> {
        stft.analyze(signal)
            .into_iter()
            .map(|row| row.into_iter().map(|c| c.norm()).collect())
            .collect()
    }

    fn spectral_error(target: &[Vec<f64>], estimate: &[Vec<f64>]) -> f64 {
        let mut num = 0.0;
        let mut den = 0.0;
        for (a, b) in target.iter().zip(estimate) {
            for (x, y) in a.iter().zip(b) {
                num += (x - y).powi(2);
                den += x * x;
            }
        }
        (num / den).sqrt()
    }

    fn tone(len: usize) -> Vec<f64> {
        (0..len)
            .map(|n| {
                let t = n as f64;
                0.6 * (t * 0.21).sin() + 0.3 * (t * 0.77).sin()
            })
            .collect()
    }

    #[test]
    fn iterations_reduce_spectral_error() {
        let stft = Stft::new(64, 64, 16);
        let target = magnitude_of(&stft, &tone(512));

        let few = GriffinLim::new(Stft::new(64, 64, 16), 1, 0.99, PhaseInit::Random);
        let many = GriffinLim::new(Stft::new(64, 64, 16), 60, 0.99, PhaseInit::Random);
        let a = few.reconstruct(&target, &mut ChaCha8Rng::seed_from_u64(3), None);
        let b = many.reconstruct(&target, &mut ChaCha8Rng::seed_from_u64(3), None);
        let err_few = spectral_error(&target, &magnitude_of(&stft, &a));
        let err_many = spectral_error(&target, &magnitude_of(&stft, &b));
        assert!(err_many < err_few, "{err_many} !< {err_few}");
        assert!(err_many < 0.2, "spectral error {err_many}");
    }

    #[test]
    fn zero_iterations_returns_initial_guess() {
        let gl = GriffinLim::new(Stft::new(32, 32, 8), 0, 0.0, PhaseInit::Zeros);
        let magnitude = vec![vec![1.0; 17]; 5];
        let out = gl.reconstruct(&magnitude, &mut ChaCha8Rng::seed_from_u64(0), Some(40));
        assert_eq!(out.len(), 40);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn same_seed_same_signal() {
        let gl = GriffinLim::new(Stft::new(32, 32, 8), 3, 0.5, PhaseInit::Random);
        let magnitude = vec![vec![0.5; 17]; 6];
        let a = gl.reconstruct(&magnitude, &mut ChaCha8Rng::seed_from_u64(11), None);
        let b = gl.reconstruct(&magnitude, &mut ChaCha8Rng::seed_from_u64(11), None);
        assert_eq!(a, b);
    }
}
