mod common;

use common::tiny_config;
use dv3::audio::{SpectrogramTransform, Vocoder};

fn tone(len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| {
            let t = n as f32;
            0.4 * (t * 0.3).sin() + 0.2 * (t * 1.1).sin()
        })
        .collect()
}

/// `‖|S| − |Ŝ|‖ / ‖S‖` over the frames both spectrograms share.
fn spectral_convergence(target: &[Vec<f64>], estimate: &[Vec<f64>]) -> f64 {
    let frames = target.len().min(estimate.len()) - 1;
    let mut num = 0.0;
    let mut den = 0.0;
    for (a, b) in target[..frames].iter().zip(&estimate[..frames]) {
        for (x, y) in a.iter().zip(b) {
            num += (x - y).powi(2);
            den += x * x;
        }
    }
    (num / den).sqrt()
}

#[test]
fn griffin_lim_round_trip_matches_the_magnitude() {
    let mut config = tiny_config();
    config.synthesis.power = 1.0;
    config.synthesis.n_iter = 100;
    let transform = SpectrogramTransform::new(&config.transform);
    let vocoder = Vocoder::new(&config.transform, &config.synthesis);

    let target = transform.analyze(&tone(1024));
    let audio = vocoder.reconstruct(&target, 7).expect("reconstruct");
    assert_eq!(audio.len(), target.frames * config.transform.hop_length);

    let rebuilt = transform.analyze(&audio);
    let error = spectral_convergence(
        &transform.denormalize(&target, 1.0),
        &transform.denormalize(&rebuilt, 1.0),
    );
    assert!(error < 0.25, "spectral convergence {error}");
}

#[test]
fn more_iterations_do_not_hurt() {
    let mut config = tiny_config();
    config.synthesis.power = 1.0;
    let transform = SpectrogramTransform::new(&config.transform);
    let target = transform.analyze(&tone(512));
    let reference = transform.denormalize(&target, 1.0);

    let mut errors = Vec::new();
    for n_iter in [0, 50] {
        config.synthesis.n_iter = n_iter;
        let audio = Vocoder::new(&config.transform, &config.synthesis)
            .reconstruct(&target, 3)
            .expect("reconstruct");
        let rebuilt = transform.denormalize(&transform.analyze(&audio), 1.0);
        errors.push(spectral_convergence(&reference, &rebuilt));
    }
    assert!(errors[1] < errors[0], "{errors:?}");
}

#[test]
fn same_seed_same_waveform() {
    let config = tiny_config();
    let transform = SpectrogramTransform::new(&config.transform);
    let spec = transform.analyze(&tone(256));
    let vocoder = Vocoder::from_config(&config);
    assert_eq!(
        vocoder.reconstruct(&spec, 5).unwrap(),
        vocoder.reconstruct(&spec, 5).unwrap()
    );
}
