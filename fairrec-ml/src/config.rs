//! Trainer configuration.
//!
//! Every field carries a default so a partial TOML file (or an empty one)
//! yields a runnable configuration. Loading goes through
//! [`fairrec_core::load_layered`], so environment variables such as
//! `FAIRREC_EPOCHS=50` or `FAIRREC_CLIP_GRAD_NORM__MAX_NORM=5.0` override files.

use crate::error::MlError;
use crate::training::plan::ModelKind;
use fairrec_core::config::ENV_PREFIX;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How evaluation scores are interpreted by the metric aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    /// Top-K ranking metrics over a dense user x item score matrix.
    #[default]
    Ranking,
    /// Value metrics (e.g. rating error) over raw per-pair scores.
    Value,
}

/// Whether the pretrain best score survives the switch to finetuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinetuneScorePolicy {
    /// Finetuning starts from a blank best score.
    #[default]
    Reset,
    /// Finetuning must beat the pretrain best score to checkpoint.
    Carry,
}

/// Global gradient-norm clipping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipGradNorm {
    pub max_norm: f32,
    /// p of the p-norm; `inf` selects the max-abs norm.
    #[serde(default = "default_norm_type", with = "crate::float_serde::single")]
    pub norm_type: f32,
}

fn default_norm_type() -> f32 {
    2.0
}

/// A parameter group bound to an optimizer role: every parameter whose name
/// equals `prefix` or starts with `prefix.`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroupConfig {
    pub prefix: String,
    /// Overrides the role's learning rate for this group.
    #[serde(default)]
    pub learning_rate: Option<f64>,
}

/// Configuration for a training/evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Model identity, e.g. `PFCN_MLP` or `FairGo_GCN`.
    pub model: String,
    pub dataset: String,

    // Optimisation
    pub learner: String,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Model-side regularisation weight; only used to warn about double regularisation.
    pub reg_weight: Option<f64>,
    /// Momentum for the `sgd` learner.
    pub momentum: f64,
    pub clip_grad_norm: Option<ClipGradNorm>,
    /// Replaces the preset role table for the model kind when non-empty.
    pub optimizer_roles: BTreeMap<String, Vec<ParamGroupConfig>>,

    // Schedule
    pub epochs: usize,
    /// Validate every `eval_step` epochs; 0 disables validation.
    pub eval_step: usize,
    /// Non-improving validations tolerated before stopping.
    pub stopping_step: usize,
    pub valid_metric: String,
    pub valid_metric_bigger: bool,

    // Evaluation
    pub eval_batch_size: usize,
    pub eval_type: EvalType,
    pub item_id_field: String,

    // Adversarial fairness
    pub sst_attr_list: Vec<String>,
    pub filter_mode: String,
    /// Filter/base parameters are updated every `train_epoch_interval` epochs.
    pub train_epoch_interval: usize,
    pub pretrain_epochs: usize,
    pub load_pretrain_weight: bool,
    pub pretrain_model_file_path: Option<PathBuf>,
    pub aggr_method: String,
    pub finetune_score_policy: FinetuneScorePolicy,
    pub save_sst_embed: bool,

    // Runtime
    pub device: String,
    pub checkpoint_dir: PathBuf,
    pub seed: u64,
    pub ips_norm: bool,
    pub loss_decimal_place: usize,
    pub show_progress: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            model: "BPR".to_string(),
            dataset: "ml-100k".to_string(),
            learner: "adam".to_string(),
            learning_rate: 0.001,
            weight_decay: 0.0,
            reg_weight: None,
            momentum: 0.0,
            clip_grad_norm: None,
            optimizer_roles: BTreeMap::new(),
            epochs: 300,
            eval_step: 1,
            stopping_step: 10,
            valid_metric: "MRR@10".to_string(),
            valid_metric_bigger: true,
            eval_batch_size: 4096,
            eval_type: EvalType::Ranking,
            item_id_field: "item_id".to_string(),
            sst_attr_list: Vec::new(),
            filter_mode: "none".to_string(),
            train_epoch_interval: 1,
            pretrain_epochs: 0,
            load_pretrain_weight: false,
            pretrain_model_file_path: None,
            aggr_method: "SM".to_string(),
            finetune_score_policy: FinetuneScorePolicy::Reset,
            save_sst_embed: false,
            device: "cpu".to_string(),
            checkpoint_dir: PathBuf::from("saved"),
            seed: 2020,
            ips_norm: false,
            loss_decimal_place: 4,
            show_progress: false,
        }
    }
}

impl TrainerConfig {
    /// Load from TOML files, `FAIRREC_*` environment variables and overrides.
    pub fn load(files: &[PathBuf], overrides: Option<&TrainerConfig>) -> Result<Self, MlError> {
        let config: Self = fairrec_core::load_layered(files, ENV_PREFIX, overrides)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could honour.
    pub fn validate(&self) -> Result<(), MlError> {
        if self.model.trim().is_empty() {
            return Err(MlError::config("model name must not be empty"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(MlError::config(format!(
                "learning_rate must be a finite non-negative number, got {}",
                self.learning_rate
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(MlError::config(format!(
                "weight_decay must be a finite non-negative number, got {}",
                self.weight_decay
            )));
        }
        if self.eval_batch_size == 0 {
            return Err(MlError::config("eval_batch_size must be positive"));
        }
        if self.valid_metric.trim().is_empty() {
            return Err(MlError::config("valid_metric must not be empty"));
        }
        if self.train_epoch_interval == 0 {
            return Err(MlError::config("train_epoch_interval must be positive"));
        }
        if let Some(clip) = &self.clip_grad_norm {
            if clip.max_norm.is_nan() || clip.max_norm <= 0.0 {
                return Err(MlError::config("clip_grad_norm.max_norm must be positive"));
            }
            if clip.norm_type.is_nan() || clip.norm_type <= 0.0 {
                return Err(MlError::config("clip_grad_norm.norm_type must be positive"));
            }
        }
        if self.sst_attr_list.is_empty()
            && ModelKind::parse(&self.model).requires_attributes(self.filter_enabled())
        {
            return Err(MlError::config(format!(
                "{} trains against sensitive attributes but sst_attr_list is empty",
                self.model
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for attr in &self.sst_attr_list {
            if !seen.insert(attr.as_str()) {
                return Err(MlError::config(format!("duplicate sensitive attribute '{attr}'")));
            }
        }
        Ok(())
    }

    /// Whether an adversarial filter is configured.
    pub fn filter_enabled(&self) -> bool {
        !self.filter_mode.eq_ignore_ascii_case("none")
    }

    /// Model identity plus a SHA-256 over the serialized configuration.
    pub fn fingerprint(&self) -> Result<String, MlError> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{}:{:x}", self.model, hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.filter_enabled());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("pfcn.toml");
        std::fs::write(
            &file,
            r#"
model = "PFCN_MLP"
sst_attr_list = ["gender", "age"]
filter_mode = "SM"
epochs = 50

[clip_grad_norm]
max_norm = 5.0

[[optimizer_roles.filter]]
prefix = "filter_layer"
learning_rate = 0.01
"#,
        )
        .unwrap();

        let config = TrainerConfig::load(&[file], None).unwrap();
        assert_eq!(config.model, "PFCN_MLP");
        assert_eq!(config.sst_attr_list, vec!["gender", "age"]);
        assert_eq!(config.epochs, 50);
        assert_eq!(config.learner, "adam");
        assert_eq!(
            config.clip_grad_norm,
            Some(ClipGradNorm {
                max_norm: 5.0,
                norm_type: 2.0
            })
        );
        assert_eq!(config.optimizer_roles["filter"][0].learning_rate, Some(0.01));
        assert!(config.filter_enabled());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrainerConfig {
            eval_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MlError::Config(_))));

        config.eval_batch_size = 16;
        config.learning_rate = f64::NAN;
        assert!(config.validate().is_err());

        config.learning_rate = 0.01;
        config.sst_attr_list = vec!["gender".into(), "gender".into()];
        assert!(config.validate().is_err());

        config.sst_attr_list = vec!["gender".into()];
        config.train_epoch_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adversarial_models_need_attributes() {
        let mut config = TrainerConfig {
            model: "FairGo_PMF".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.sst_attr_list = vec!["gender".into()];
        assert!(config.validate().is_ok());

        let pfcn = TrainerConfig {
            model: "PFCN_MLP".into(),
            filter_mode: "none".into(),
            ..Default::default()
        };
        assert!(pfcn.validate().is_ok());
    }

    #[test]
    fn test_inf_norm_survives_json() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("clip.toml");
        std::fs::write(&file, "[clip_grad_norm]\nmax_norm = 5.0\nnorm_type = inf\n").unwrap();

        let config = TrainerConfig::load(&[file], None).unwrap();
        assert_eq!(config.clip_grad_norm.unwrap().norm_type, f32::INFINITY);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""norm_type":"inf""#));
        let back: TrainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.fingerprint().unwrap(), config.fingerprint().unwrap());

        let two = TrainerConfig {
            clip_grad_norm: Some(ClipGradNorm {
                max_norm: 5.0,
                norm_type: 2.0,
            }),
            ..config.clone()
        };
        assert_ne!(two.fingerprint().unwrap(), config.fingerprint().unwrap());
    }

    #[test]
    fn test_fingerprint_tracks_config() {
        let a = TrainerConfig::default();
        let mut b = a.clone();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        b.learning_rate = 0.01;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert!(a.fingerprint().unwrap().starts_with("BPR:"));
    }
}
