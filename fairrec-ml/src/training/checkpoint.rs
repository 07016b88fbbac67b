//! Checkpoint persistence for training runs.

use crate::config::TrainerConfig;
use crate::error::MlError;
use crate::model::{StateDict, TrainStage};
use crate::training::optim::OptimizerSnapshot;
use chrono::{DateTime, Local, Utc};
use fairrec_core::persistence::{atomic_write_json_compact, ensure_dir, load_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Layout version written into every checkpoint.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Everything needed to continue a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    /// Model identity the state was produced by.
    pub model: String,
    pub fingerprint: String,
    pub config: TrainerConfig,
    pub stage: TrainStage,
    /// Last completed epoch; `-1` before any training.
    pub epoch: i64,
    pub step: usize,
    /// `None` until a validation score exists.
    #[serde(default, with = "crate::float_serde::optional")]
    pub best_score: Option<f64>,
    pub state_dict: StateDict,
    #[serde(default)]
    pub other_parameter: Option<serde_json::Value>,
    /// Optimizer state per role name.
    pub optimizers: BTreeMap<String, OptimizerSnapshot>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Epoch a resumed run starts from.
    pub fn next_epoch(&self) -> usize {
        usize::try_from(self.epoch + 1).unwrap_or(0)
    }

    /// Total number of stored parameter values.
    pub fn parameter_count(&self) -> usize {
        self.state_dict.values().map(|v| v.len()).sum()
    }
}

/// Reads and writes checkpoints under one directory.
///
/// Each store owns a default file, named after the model and the local time
/// the store was created; saves overwrite it.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, model: &str) -> Self {
        let dir = dir.into();
        let file = format!("{model}-{}.json", Local::now().format("%b-%d-%Y_%H-%M-%S"));
        let path = dir.join(file);
        Self { dir, path }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The default checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point the default file elsewhere, e.g. at a resumed checkpoint.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// A sibling file in the checkpoint directory.
    pub fn sibling(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Overwrite the default file.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, MlError> {
        self.save_to(&self.path, checkpoint)?;
        Ok(self.path.clone())
    }

    pub fn save_to(&self, path: &Path, checkpoint: &Checkpoint) -> Result<(), MlError> {
        ensure_dir(&self.dir)?;
        atomic_write_json_compact(path, checkpoint)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Checkpoint, MlError> {
        let checkpoint: Checkpoint = load_json(path)?
            .ok_or_else(|| MlError::not_found(format!("checkpoint {}", path.display())))?;
        if checkpoint.format_version > CHECKPOINT_FORMAT_VERSION {
            return Err(MlError::checkpoint(format!(
                "{} has format version {}, this build reads up to {CHECKPOINT_FORMAT_VERSION}",
                path.display(),
                checkpoint.format_version
            )));
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optim::{LearnerKind, SlotState};
    use ndarray::{ArrayD, IxDyn};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        let config = TrainerConfig::default();
        let mut slots = BTreeMap::new();
        slots.insert(
            "user_embedding_layer.weight".to_string(),
            SlotState {
                step: 3,
                first: Some(ArrayD::from_elem(IxDyn(&[2]), 0.1_f32 / 3.0)),
                second: Some(ArrayD::from_elem(IxDyn(&[2]), 1e-7_f32)),
            },
        );
        Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            model: config.model.clone(),
            fingerprint: config.fingerprint().unwrap(),
            config,
            stage: TrainStage::Finetune,
            epoch: 7,
            step: 2,
            best_score: Some(0.42),
            state_dict: StateDict::from([(
                "user_embedding_layer.weight".to_string(),
                ArrayD::from_elem(IxDyn(&[2]), 0.7_f32),
            )]),
            other_parameter: Some(serde_json::json!({"ips": [0.25, 0.75]})),
            optimizers: BTreeMap::from([(
                "base".to_string(),
                OptimizerSnapshot {
                    kind: LearnerKind::Adam,
                    slots,
                },
            )]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_roundtrip_exact() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("saved"), "BPR");
        let checkpoint = sample();

        let path = store.save(&checkpoint).unwrap();
        let loaded = CheckpointStore::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.best_score.unwrap().to_bits(), 0.42_f64.to_bits());
        assert_eq!(loaded.next_epoch(), 8);
    }

    #[test]
    fn test_non_finite_values_reload() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), "BPR");
        let mut checkpoint = sample();
        checkpoint.best_score = Some(f64::NEG_INFINITY);
        checkpoint.config.clip_grad_norm = Some(crate::config::ClipGradNorm {
            max_norm: 1.0,
            norm_type: f32::INFINITY,
        });

        let path = store.save(&checkpoint).unwrap();
        let loaded = CheckpointStore::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn test_file_name_uses_model() {
        let store = CheckpointStore::new("saved", "PFCN_MLP");
        let name = store.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("PFCN_MLP-"));
        assert!(name.ends_with(".json"));
    }

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = CheckpointStore::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }

    #[test]
    fn test_pre_training_marker_resumes_at_zero() {
        let mut checkpoint = sample();
        checkpoint.epoch = -1;
        assert_eq!(checkpoint.next_epoch(), 0);
    }

    #[test]
    fn test_newer_format_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), "BPR");
        let mut checkpoint = sample();
        checkpoint.format_version = CHECKPOINT_FORMAT_VERSION + 1;
        let path = store.save(&checkpoint).unwrap();
        assert!(matches!(CheckpointStore::load(&path), Err(MlError::Checkpoint(_))));
    }
}
