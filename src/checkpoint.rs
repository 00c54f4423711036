//! Checkpoint discovery, loading and saving.
//!
//! Checkpoints live in `<output>/checkpoints/step-<N>.safetensors`. A plain-text
//! index file `<output>/checkpoints/checkpoint` names the latest one with a line
//! `model_checkpoint_path: step-<N>`.

use crate::error::Dv3Error;
use crate::perf::{self, Metric};
use crate::weights::{ParamStore, WeightNormLayer};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CHECKPOINT_DIR: &str = "checkpoints";
const INDEX_FILE: &str = "checkpoint";
const INDEX_KEY: &str = "model_checkpoint_path";
const STEP_PREFIX: &str = "step-";
const EXTENSION: &str = "safetensors";
/// Metadata key carrying the training iteration.
pub const ITERATION_KEY: &str = "iteration";

/// Which checkpoint to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSelector {
    /// An explicit file.
    Path(PathBuf),
    /// `step-<N>` inside the output directory.
    Iteration(u64),
    /// The newest checkpoint inside the output directory.
    Latest,
}

/// Parameters with weight norm folded, plus the iteration they were saved at.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub params: ParamStore,
    pub iteration: u64,
}

pub fn checkpoint_dir(output: &Path) -> PathBuf {
    output.join(CHECKPOINT_DIR)
}

pub fn checkpoint_path(output: &Path, iteration: u64) -> PathBuf {
    checkpoint_dir(output).join(format!("{STEP_PREFIX}{iteration}.{EXTENSION}"))
}

/// Parse `N` from a `step-N` name.
fn parse_step(stem: &str) -> Option<u64> {
    stem.strip_prefix(STEP_PREFIX)?.parse().ok()
}

/// All `step-N.safetensors` files in the output directory, oldest first.
pub fn list_checkpoints(output: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let dir = checkpoint_dir(output);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        if let Some(step) = path.file_stem().and_then(|s| s.to_str()).and_then(parse_step) {
            found.push((step, path));
        }
    }
    found.sort_by_key(|(step, _)| *step);
    Ok(found)
}

fn read_index(output: &Path) -> Option<u64> {
    let text = fs::read_to_string(checkpoint_dir(output).join(INDEX_FILE)).ok()?;
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == INDEX_KEY).then(|| parse_step(value.trim()))?
    })
}

/// Resolve a selector to a file and, when the selector determines it, an iteration.
pub fn resolve(selector: &CheckpointSelector, output: &Path) -> Result<(PathBuf, Option<u64>)> {
    let (path, iteration) = match selector {
        CheckpointSelector::Path(path) => (path.clone(), None),
        CheckpointSelector::Iteration(step) => (checkpoint_path(output, *step), Some(*step)),
        CheckpointSelector::Latest => {
            let step = match read_index(output) {
                Some(step) => step,
                None => list_checkpoints(output)?
                    .last()
                    .map(|(step, _)| *step)
                    .ok_or_else(|| {
                        Dv3Error::checkpoint(format!(
                            "no checkpoints under {}",
                            checkpoint_dir(output).display()
                        ))
                    })?,
            };
            (checkpoint_path(output, step), Some(step))
        }
    };
    if !path.is_file() {
        return Err(Dv3Error::checkpoint(format!(
            "checkpoint not found: {}",
            path.display()
        )));
    }
    Ok((path, iteration))
}

fn iteration_of(path: &Path, params: &ParamStore) -> u64 {
    if let Some(step) = params
        .metadata()
        .get(ITERATION_KEY)
        .and_then(|v| v.parse().ok())
    {
        return step;
    }
    if let Some(step) = path.file_stem().and_then(|s| s.to_str()).and_then(parse_step) {
        return step;
    }
    warn!(path = %path.display(), "cannot determine checkpoint iteration, using 0");
    0
}

/// Load a checkpoint and fold every weight-normalized layer in `layers`.
///
/// # Errors
///
/// [`Dv3Error::Checkpoint`] when the file is missing, unreadable, or holds
/// inconsistent weight-norm pairs.
pub fn load_checkpoint(
    selector: &CheckpointSelector,
    output: &Path,
    layers: &[WeightNormLayer],
) -> Result<Checkpoint> {
    let _span = perf::span(Metric::CheckpointLoad);
    let (path, known_iteration) = resolve(selector, output)?;
    let mut params = ParamStore::load(&path)?;
    let mut folded = 0;
    for layer in layers {
        if params.remove_weight_norm(layer)? {
            folded += 1;
        }
    }
    let iteration = known_iteration.unwrap_or_else(|| iteration_of(&path, &params));
    info!(path = %path.display(), iteration, tensors = params.len(), "loaded checkpoint");
    debug!(folded, "removed weight norm");
    Ok(Checkpoint { params, iteration })
}

/// Write `params` as `step-<iteration>` in weight-normalized layout and point
/// the index file at it.
pub fn save_checkpoint(
    mut params: ParamStore,
    output: &Path,
    iteration: u64,
    layers: &[WeightNormLayer],
) -> Result<PathBuf> {
    for layer in layers {
        params.apply_weight_norm(layer)?;
    }
    params.set_metadata(ITERATION_KEY, iteration.to_string());
    let path = checkpoint_path(output, iteration);
    params.save(&path)?;
    fs::write(
        checkpoint_dir(output).join(INDEX_FILE),
        format!("{INDEX_KEY}: {STEP_PREFIX}{iteration}\n"),
    )?;
    info!(path = %path.display(), "saved checkpoint");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::category;
    use crate::weights::WeightTensor;
    use tempfile::tempdir;

    fn store() -> ParamStore {
        let mut store = ParamStore::new();
        store.insert(
            "layer.weight",
            WeightTensor::new(vec![2, 2], vec![3.0, 0.0, 4.0, 1.0]).unwrap(),
        );
        store
    }

    fn layers() -> Vec<WeightNormLayer> {
        vec![WeightNormLayer::new("layer", 1)]
    }

    #[test]
    fn save_then_load_restores_folded_weights() {
        let dir = tempdir().unwrap();
        let path = save_checkpoint(store(), dir.path(), 1000, &layers()).unwrap();
        assert_eq!(path, checkpoint_path(dir.path(), 1000));

        let raw = ParamStore::load(&path).unwrap();
        assert!(raw.contains("layer.weight_g"));
        assert!(!raw.contains("layer.weight"));

        let loaded = load_checkpoint(&CheckpointSelector::Latest, dir.path(), &layers()).unwrap();
        assert_eq!(loaded.iteration, 1000);
        let weight = loaded.params.get("layer.weight").unwrap();
        for (a, b) in weight.values.iter().zip([3.0, 0.0, 4.0, 1.0]) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn latest_falls_back_to_highest_step() {
        let dir = tempdir().unwrap();
        for step in [5, 40, 12] {
            store().save(checkpoint_path(dir.path(), step)).unwrap();
        }
        let (path, step) = resolve(&CheckpointSelector::Latest, dir.path()).unwrap();
        assert_eq!(step, Some(40));
        assert_eq!(path, checkpoint_path(dir.path(), 40));
        let listed: Vec<u64> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(listed, vec![5, 12, 40]);
    }

    #[test]
    fn index_file_wins_over_file_order() {
        let dir = tempdir().unwrap();
        save_checkpoint(store(), dir.path(), 7, &layers()).unwrap();
        store().save(checkpoint_path(dir.path(), 9)).unwrap();
        let (_, step) = resolve(&CheckpointSelector::Latest, dir.path()).unwrap();
        assert_eq!(step, Some(7));
    }

    #[test]
    fn explicit_path_reads_iteration_from_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("step-250.safetensors");
        store().save(&path).unwrap();
        let loaded = load_checkpoint(&CheckpointSelector::Path(path), dir.path(), &[]).unwrap();
        assert_eq!(loaded.iteration, 250);

        let odd = dir.path().join("weights.safetensors");
        store().save(&odd).unwrap();
        let loaded = load_checkpoint(&CheckpointSelector::Path(odd), dir.path(), &[]).unwrap();
        assert_eq!(loaded.iteration, 0);
    }

    #[test]
    fn explicit_path_prefers_recorded_iteration_over_name() {
        let dir = tempdir().unwrap();
        let saved = save_checkpoint(store(), dir.path(), 300, &layers()).unwrap();
        let renamed = dir.path().join("step-5.safetensors");
        std::fs::rename(&saved, &renamed).unwrap();
        let loaded =
            load_checkpoint(&CheckpointSelector::Path(renamed), dir.path(), &layers()).unwrap();
        assert_eq!(loaded.iteration, 300);
    }

    #[test]
    fn missing_checkpoint_is_a_checkpoint_error() {
        let dir = tempdir().unwrap();
        for selector in [
            CheckpointSelector::Latest,
            CheckpointSelector::Iteration(3),
            CheckpointSelector::Path(dir.path().join("nope.safetensors")),
        ] {
            let err = load_checkpoint(&selector, dir.path(), &[]).unwrap_err();
            assert!(matches!(category(&err), Some(Dv3Error::Checkpoint(_))));
        }
    }
}
