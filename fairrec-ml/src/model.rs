//! The recommender capability the engine trains and evaluates.
//!
//! Forward and backward computation belong to the model. The engine only
//! asks for losses, triggers gradient computation, reads and writes named
//! parameters, and requests predictions.

use crate::data::Interaction;
use crate::error::MlError;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A trainable tensor and its most recent gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: ArrayD<f32>,
    pub grad: Option<ArrayD<f32>>,
}

impl Parameter {
    pub fn new(value: ArrayD<f32>) -> Self {
        Self { value, grad: None }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}

/// Parameter values by name.
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

/// A batch loss: one scalar, or additive components reported separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Loss {
    Scalar(f64),
    /// Adversarial epochs: `[filter, discriminator]` for masked models,
    /// `[discriminator, filter]` for staged ones.
    Components(Vec<f64>),
}

impl Loss {
    /// The optimisation objective: the sum of all components.
    pub fn total(&self) -> f64 {
        match self {
            Loss::Scalar(v) => *v,
            Loss::Components(parts) => parts.iter().sum(),
        }
    }

    pub fn is_nan(&self) -> bool {
        self.total().is_nan()
    }

    /// Zero loss with the same shape as `self`.
    pub fn zeroed(&self) -> Loss {
        match self {
            Loss::Scalar(_) => Loss::Scalar(0.0),
            Loss::Components(parts) => Loss::Components(vec![0.0; parts.len()]),
        }
    }

    /// Add `other` component-wise.
    pub fn accumulate(&mut self, other: &Loss) -> Result<(), MlError> {
        match (self, other) {
            (Loss::Scalar(a), Loss::Scalar(b)) => *a += b,
            (Loss::Components(a), Loss::Components(b)) if a.len() == b.len() => {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
            }
            (this, other) => {
                return Err(MlError::model(format!(
                    "loss shape changed within an epoch: {this} then {other}"
                )));
            }
        }
        Ok(())
    }

    /// Log line fragment: `train loss: 0.1234` or `train_loss1: 0.1000, train_loss2: 0.0500`.
    pub fn describe(&self, decimals: usize) -> String {
        match self {
            Loss::Scalar(v) => format!("train loss: {v:.decimals$}"),
            Loss::Components(parts) => parts
                .iter()
                .enumerate()
                .map(|(i, v)| format!("train_loss{}: {v:.decimals$}", i + 1))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl fmt::Display for Loss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loss::Scalar(v) => write!(f, "{v}"),
            Loss::Components(parts) => write!(f, "{parts:?}"),
        }
    }
}

/// Lifecycle stage of a staged adversarial run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStage {
    Pretrain,
    #[default]
    Finetune,
}

impl TrainStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainStage::Pretrain => "pretrain",
            TrainStage::Finetune => "finetune",
        }
    }
}

impl fmt::Display for TrainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Train/eval mode toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

/// A recommender trained and evaluated by the orchestrator.
///
/// `revealed` is the subset of sensitive attributes the pass may use;
/// `None` means the model's default (all, or none for plain models).
pub trait Recommender {
    /// Model identity, matched against the checkpoint's.
    fn name(&self) -> &str;

    fn set_mode(&mut self, mode: ModelMode);

    /// Recommendation (or filter) loss for a batch.
    fn calculate_loss(
        &mut self,
        batch: &Interaction,
        revealed: Option<&[String]>,
    ) -> Result<Loss, MlError>;

    /// Populate the gradients of every parameter the last loss touched.
    fn backward(&mut self, loss: &Loss) -> Result<(), MlError>;

    /// Scores for each row of `batch`.
    fn predict(&self, batch: &Interaction, revealed: Option<&[String]>) -> Result<ArrayD<f32>, MlError>;

    fn parameters(&self) -> Vec<(&str, &Parameter)>;

    fn parameters_mut(&mut self) -> Vec<(&str, &mut Parameter)>;

    fn set_train_stage(&mut self, _stage: TrainStage) {}

    /// Discriminator loss for adversarial models.
    fn calculate_discriminator_loss(
        &mut self,
        _batch: &Interaction,
        _revealed: Option<&[String]>,
    ) -> Result<Loss, MlError> {
        Err(MlError::model(format!("{} has no discriminator", self.name())))
    }

    /// All-item scores for each user row, or `None` when unsupported.
    fn full_sort_predict(
        &self,
        _batch: &Interaction,
        _revealed: Option<&[String]>,
    ) -> Result<Option<ArrayD<f32>>, MlError> {
        Ok(None)
    }

    /// Non-parameter state persisted alongside the parameters.
    fn other_parameter(&self) -> Option<serde_json::Value> {
        None
    }

    fn load_other_parameter(&mut self, _state: Option<&serde_json::Value>) -> Result<(), MlError> {
        Ok(())
    }

    /// Filtered user embeddings for the given attribute subset.
    fn sensitive_embeddings(
        &self,
        _user_features: &Interaction,
        _revealed: Option<&[String]>,
    ) -> Result<ArrayD<f32>, MlError> {
        Err(MlError::model(format!(
            "{} cannot export sensitive embeddings",
            self.name()
        )))
    }

    /// Post-epoch inverse-propensity normalisation hook.
    fn normalize_ips(&mut self) -> Result<(), MlError> {
        Ok(())
    }

    fn to_device(&mut self, _device: &str) -> Result<(), MlError> {
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        self.parameters()
            .into_iter()
            .map(|(name, p)| (name.to_string(), p.value.clone()))
            .collect()
    }

    /// Bind every entry of `state`; unknown names and shape changes are errors.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), MlError> {
        let model = self.name().to_string();
        let mut params: BTreeMap<&str, &mut Parameter> = self.parameters_mut().into_iter().collect();
        for (name, value) in state {
            let param = params.get_mut(name.as_str()).ok_or_else(|| {
                MlError::model(format!("unexpected parameter '{name}' for model {model}"))
            })?;
            if param.value.shape() != value.shape() {
                return Err(MlError::model(format!(
                    "shape mismatch for '{name}': model {:?}, state {:?}",
                    param.value.shape(),
                    value.shape()
                )));
            }
            param.value.assign(value);
        }
        Ok(())
    }
}
