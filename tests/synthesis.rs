mod common;

use burn_ndarray::NdArrayDevice;
use common::{tiny_config, write_checkpoint, write_config_with, TestBackend, ITERATION};
use dv3::audio::io::WavIo;
use dv3::checkpoint::CheckpointSelector;
use dv3::config::{load_config, Config, FocusMode};
use dv3::runtime::{ExecutionContext, SynthesisRuntime};
use std::path::Path;

fn load(config: &Config, output: &Path) -> SynthesisRuntime<TestBackend> {
    SynthesisRuntime::from_checkpoint(
        config,
        &CheckpointSelector::Latest,
        output,
        ExecutionContext::new(NdArrayDevice::default()),
    )
    .expect("load runtime")
}

#[test]
fn two_lines_write_wav_and_png_per_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config();
    write_checkpoint(&config, dir.path(), Some(50.0));
    let runtime = load(&config, dir.path());
    assert_eq!(runtime.iteration(), ITERATION);

    let report = runtime
        .synthesize_lines(&["hello world", "testing"], dir.path(), None)
        .expect("synthesize");
    assert!(report.is_success(), "{:?}", report.failed);

    let hop = config.transform.hop_length;
    let frames_per_step = config.model.outputs_per_step * config.model.downsample_factor;
    for idx in 0..2 {
        let wav = dir.path().join("synthesis").join(format!("test_{idx}_step{ITERATION}.wav"));
        let png = dir.path().join("synthesis").join(format!("test_{idx}_step_{ITERATION}.png"));
        assert!(png.is_file(), "missing {}", png.display());
        let (samples, rate) = WavIo::read_mono(&wav).expect("read wav");
        assert_eq!(rate, config.transform.sample_rate);
        let written = &report.written[idx];
        assert_eq!(written.steps, config.synthesis.min_decoder_steps);
        assert_eq!(samples.len(), written.steps * frames_per_step * hop);
    }
}

#[test]
fn synthesis_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config();
    write_checkpoint(&config, dir.path(), None);

    let first = load(&config, dir.path())
        .synthesize_text(0, "Printing, in the only sense.")
        .expect("first");
    let second = load(&config, dir.path())
        .synthesize_text(0, "Printing, in the only sense.")
        .expect("second");
    assert_eq!(first.waveform, second.waveform);
    assert_eq!(first.alignment, second.alignment);
    assert_eq!(first.steps, second.steps);
}

#[test]
fn decoder_that_never_stops_is_truncated_at_max_steps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config();
    write_checkpoint(&config, dir.path(), Some(-50.0));
    let utterance = load(&config, dir.path())
        .synthesize_text(0, "a long sentence that never ends")
        .expect("synthesize");
    assert!(utterance.truncated);
    assert_eq!(utterance.steps, config.synthesis.max_decoder_steps);
    assert_eq!(utterance.alignment.steps, utterance.steps);
}

#[test]
fn alignment_rows_are_distributions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config();
    write_checkpoint(&config, dir.path(), Some(-50.0));
    let utterance = load(&config, dir.path())
        .synthesize_text(0, "abc def")
        .expect("synthesize");
    for step in 0..utterance.alignment.steps {
        let row = utterance.alignment.row(step);
        let total: f32 = row.iter().sum();
        assert!((total - 1.0).abs() < 1e-4, "step {step} sums to {total}");
        let attended = row.iter().filter(|w| **w > 0.0).count();
        let window = config.model.window_backward + config.model.window_ahead + 1;
        assert!(attended <= window);
    }
}

#[test]
fn zero_width_window_attends_one_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = tiny_config();
    config.model.window_backward = 0;
    config.model.window_ahead = 0;
    write_checkpoint(&config, dir.path(), Some(-50.0));
    let utterance = load(&config, dir.path())
        .synthesize_text(0, "one two three")
        .expect("synthesize");
    for step in 0..utterance.alignment.steps {
        let row = utterance.alignment.row(step);
        assert_eq!(row.iter().filter(|w| **w == 1.0).count(), 1);
        assert_eq!(row.iter().filter(|w| **w == 0.0).count(), row.len() - 1);
    }
    assert!(utterance.waveform.iter().all(|v| v.is_finite()));
}

#[test]
fn zero_griffin_lim_iterations_still_produce_audio() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = tiny_config();
    config.synthesis.n_iter = 0;
    write_checkpoint(&config, dir.path(), Some(50.0));
    let utterance = load(&config, dir.path())
        .synthesize_text(0, "hi")
        .expect("synthesize");
    assert_eq!(utterance.waveform.len(), utterance.frames * config.transform.hop_length);
    assert!(utterance.waveform.iter().all(|v| v.is_finite() && v.abs() <= 1.0));
}

#[test]
fn empty_line_synthesizes_from_a_single_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config();
    write_checkpoint(&config, dir.path(), Some(50.0));
    let utterance = load(&config, dir.path())
        .synthesize_text(0, "")
        .expect("synthesize");
    assert_eq!(utterance.alignment.tokens, 1);
    assert!(utterance.alignment.data.iter().all(|w| *w == 1.0));
    assert_eq!(utterance.waveform.len(), utterance.frames * config.transform.hop_length);
    assert!(utterance.waveform.iter().all(|v| v.is_finite()));
}

#[test]
fn mean_focus_from_yaml_decodes_within_the_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config_with(dir.path(), "  focus: mean\n");
    let config = load_config(&path).expect("load config");
    assert_eq!(config.synthesis.focus, FocusMode::Mean);
    write_checkpoint(&config, dir.path(), Some(-50.0));

    let utterance = load(&config, dir.path())
        .synthesize_text(0, "focus on the mean")
        .expect("synthesize");
    assert_eq!(utterance.steps, config.synthesis.max_decoder_steps);
    let window = config.model.window_backward + config.model.window_ahead + 1;
    for step in 0..utterance.alignment.steps {
        let row = utterance.alignment.row(step);
        let total: f32 = row.iter().sum();
        assert!((total - 1.0).abs() < 1e-4, "step {step} sums to {total}");
        assert!(row.iter().filter(|w| **w > 0.0).count() <= window);
    }
}

#[test]
fn trainable_positions_synthesize() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = tiny_config();
    config.model.trainable_positional_encodings = true;
    write_checkpoint(&config, dir.path(), Some(50.0));
    let utterance = load(&config, dir.path())
        .synthesize_text(0, "tables")
        .expect("synthesize");
    assert!(utterance.waveform.iter().all(|v| v.is_finite()));
}

#[test]
fn checkpoint_for_another_architecture_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config();
    write_checkpoint(&config, dir.path(), None);
    let mut wider = config.clone();
    wider.model.decoder_channels = 32;
    let err = SynthesisRuntime::<TestBackend>::from_checkpoint(
        &wider,
        &CheckpointSelector::Iteration(ITERATION),
        dir.path(),
        ExecutionContext::new(NdArrayDevice::default()),
    )
    .unwrap_err();
    assert!(matches!(
        dv3::error::category(&err),
        Some(dv3::Dv3Error::Checkpoint(_))
    ));
}
