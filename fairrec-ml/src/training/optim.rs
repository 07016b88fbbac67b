//! First-order optimizers and the per-role optimizer set.
//!
//! Each role owns one optimizer bound to the parameters matched by its
//! groups. Weight decay is L2 added to the gradient before the update.

use crate::config::{ClipGradNorm, ParamGroupConfig, TrainerConfig};
use crate::error::MlError;
use crate::model::{Parameter, Recommender};
use crate::training::clip::clip_grad_norm;
use crate::training::plan::TrainingPlan;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Group prefix matching every parameter.
pub const ALL_PARAMETERS: &str = "*";

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;
const ADAGRAD_EPS: f32 = 1e-10;
const RMSPROP_ALPHA: f32 = 0.99;
const RMSPROP_EPS: f32 = 1e-8;

/// Optimization algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerKind {
    Adam,
    Sgd,
    Adagrad,
    RmsProp,
    SparseAdam,
}

impl LearnerKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "adam" => Some(Self::Adam),
            "sgd" => Some(Self::Sgd),
            "adagrad" => Some(Self::Adagrad),
            "rmsprop" => Some(Self::RmsProp),
            "sparse_adam" => Some(Self::SparseAdam),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::Sgd => "sgd",
            Self::Adagrad => "adagrad",
            Self::RmsProp => "rmsprop",
            Self::SparseAdam => "sparse_adam",
        }
    }
}

/// Per-parameter optimizer state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlotState {
    pub step: u64,
    /// Momentum buffer, first moment, or squared-gradient sum.
    pub first: Option<ArrayD<f32>>,
    /// Second moment.
    pub second: Option<ArrayD<f32>>,
}

/// Serializable optimizer state for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSnapshot {
    pub kind: LearnerKind,
    pub slots: BTreeMap<String, SlotState>,
}

/// One optimizer instance with per-parameter state keyed by name.
#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: LearnerKind,
    learning_rate: f64,
    weight_decay: f64,
    momentum: f64,
    slots: BTreeMap<String, SlotState>,
}

impl Optimizer {
    pub fn new(kind: LearnerKind, learning_rate: f64, weight_decay: f64, momentum: f64) -> Self {
        Self {
            kind,
            learning_rate,
            weight_decay,
            momentum,
            slots: BTreeMap::new(),
        }
    }

    /// Build from the configured learner, falling back to Adam on unknown names.
    pub fn from_config(config: &TrainerConfig) -> Self {
        let mut weight_decay = config.weight_decay;
        if weight_decay > 0.0 && config.reg_weight.is_some_and(|r| r > 0.0) {
            warn!(
                weight_decay,
                reg_weight = config.reg_weight,
                "The parameters [weight_decay] and [reg_weight] are specified simultaneously, \
                 which may lead to double regularization."
            );
        }

        let kind = match LearnerKind::parse(&config.learner) {
            Some(LearnerKind::SparseAdam) => {
                if weight_decay > 0.0 {
                    warn!("Sparse Adam cannot argument received argument [weight_decay]");
                    weight_decay = 0.0;
                }
                LearnerKind::SparseAdam
            }
            Some(kind) => kind,
            None => {
                warn!(
                    learner = %config.learner,
                    "Received unrecognized optimizer, set default Adam optimizer"
                );
                weight_decay = 0.0;
                LearnerKind::Adam
            }
        };

        Self::new(kind, config.learning_rate, weight_decay, config.momentum)
    }

    pub fn kind(&self) -> LearnerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot {
            kind: self.kind,
            slots: self.slots.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &OptimizerSnapshot) -> Result<(), MlError> {
        if snapshot.kind != self.kind {
            return Err(MlError::checkpoint(format!(
                "optimizer state is for {}, configured learner is {}",
                snapshot.kind.as_str(),
                self.kind.as_str()
            )));
        }
        self.slots = snapshot.slots.clone();
        Ok(())
    }

    /// Apply one update to `param` with learning rate `lr`. No-op without a gradient.
    pub fn update(&mut self, name: &str, param: &mut Parameter, lr: f64) -> Result<(), MlError> {
        let Some(raw_grad) = param.grad.as_ref() else {
            return Ok(());
        };
        if raw_grad.shape() != param.value.shape() {
            return Err(MlError::model(format!(
                "gradient shape {:?} does not match parameter '{name}' {:?}",
                raw_grad.shape(),
                param.value.shape()
            )));
        }

        let wd = self.weight_decay as f32;
        let grad = if wd != 0.0 {
            raw_grad + &(&param.value * wd)
        } else {
            raw_grad.clone()
        };

        let slot = self.slots.entry(name.to_string()).or_default();
        for buffer in [&slot.first, &slot.second].into_iter().flatten() {
            if buffer.shape() != param.value.shape() {
                return Err(MlError::checkpoint(format!(
                    "optimizer state for '{name}' has shape {:?}, parameter has {:?}",
                    buffer.shape(),
                    param.value.shape()
                )));
            }
        }
        slot.step += 1;

        let lr = lr as f32;
        let value = &mut param.value;
        match self.kind {
            LearnerKind::Sgd => {
                let momentum = self.momentum as f32;
                if momentum != 0.0 {
                    let buf = match slot.first.take() {
                        Some(mut buf) => {
                            Zip::from(&mut buf).and(&grad).for_each(|b, &g| *b = momentum * *b + g);
                            buf
                        }
                        None => grad.clone(),
                    };
                    Zip::from(value).and(&buf).for_each(|p, &b| *p -= lr * b);
                    slot.first = Some(buf);
                } else {
                    Zip::from(value).and(&grad).for_each(|p, &g| *p -= lr * g);
                }
            }
            LearnerKind::Adam | LearnerKind::SparseAdam => {
                let sparse = self.kind == LearnerKind::SparseAdam;
                let m = slot
                    .first
                    .get_or_insert_with(|| ArrayD::zeros(value.raw_dim()));
                let v = slot
                    .second
                    .get_or_insert_with(|| ArrayD::zeros(value.raw_dim()));
                let t = slot.step as i32;
                let bias1 = 1.0 - ADAM_BETA1.powi(t);
                let bias2 = 1.0 - ADAM_BETA2.powi(t);
                let step_size = lr / bias1;
                Zip::from(value)
                    .and(&grad)
                    .and(m)
                    .and(v)
                    .for_each(|p, &g, m, v| {
                        if sparse && g == 0.0 {
                            return;
                        }
                        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                        let denom = v.sqrt() / bias2.sqrt() + ADAM_EPS;
                        *p -= step_size * *m / denom;
                    });
            }
            LearnerKind::Adagrad => {
                let sum = slot
                    .first
                    .get_or_insert_with(|| ArrayD::zeros(value.raw_dim()));
                Zip::from(value).and(&grad).and(sum).for_each(|p, &g, s| {
                    *s += g * g;
                    *p -= lr * g / (s.sqrt() + ADAGRAD_EPS);
                });
            }
            LearnerKind::RmsProp => {
                let sq = slot
                    .second
                    .get_or_insert_with(|| ArrayD::zeros(value.raw_dim()));
                Zip::from(value).and(&grad).and(sq).for_each(|p, &g, s| {
                    *s = RMSPROP_ALPHA * *s + (1.0 - RMSPROP_ALPHA) * g * g;
                    *p -= lr * g / (s.sqrt() + RMSPROP_EPS);
                });
            }
        }
        Ok(())
    }
}

/// Named binding between a parameter subset and an optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerRole {
    Base,
    Pretrain,
    Filter,
    Discriminator,
}

impl OptimizerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Pretrain => "pretrain",
            Self::Filter => "filter",
            Self::Discriminator => "discriminator",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "base" => Some(Self::Base),
            "pretrain" => Some(Self::Pretrain),
            "filter" => Some(Self::Filter),
            "discriminator" | "dis" => Some(Self::Discriminator),
            _ => None,
        }
    }
}

impl fmt::Display for OptimizerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `name` belongs to the group with `prefix`.
pub fn group_matches(prefix: &str, name: &str) -> bool {
    prefix == ALL_PARAMETERS
        || name == prefix
        || name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[derive(Debug, Clone)]
struct RoleOptimizer {
    groups: Vec<ParamGroupConfig>,
    optimizer: Optimizer,
}

impl RoleOptimizer {
    /// Learning rate for `name`, or `None` if no group claims it.
    fn learning_rate_for(&self, name: &str) -> Option<f64> {
        self.groups
            .iter()
            .find(|g| group_matches(&g.prefix, name))
            .map(|g| g.learning_rate.unwrap_or(self.optimizer.learning_rate))
    }
}

/// One independently steppable optimizer per role.
#[derive(Debug, Clone)]
pub struct OptimizerSet {
    roles: BTreeMap<OptimizerRole, RoleOptimizer>,
}

impl OptimizerSet {
    /// One optimizer per role in `plan`, each built from the configured learner.
    pub fn build(plan: &TrainingPlan, config: &TrainerConfig) -> Self {
        let roles = plan
            .roles
            .iter()
            .map(|spec| {
                (
                    spec.role,
                    RoleOptimizer {
                        groups: spec.groups.clone(),
                        optimizer: Optimizer::from_config(config),
                    },
                )
            })
            .collect();
        Self { roles }
    }

    /// Warn about roles whose groups match none of the model's parameters.
    pub fn verify(&self, model: &dyn Recommender) {
        let names: Vec<&str> = model.parameters().into_iter().map(|(n, _)| n).collect();
        for (role, ro) in &self.roles {
            let bound = names
                .iter()
                .filter(|n| ro.learning_rate_for(n).is_some())
                .count();
            if bound == 0 {
                warn!(role = %role, model = model.name(), "optimizer role binds no parameters");
            } else {
                debug!(role = %role, parameters = bound, "optimizer role bound");
            }
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = OptimizerRole> + '_ {
        self.roles.keys().copied()
    }

    pub fn has_role(&self, role: OptimizerRole) -> bool {
        self.roles.contains_key(&role)
    }

    fn role(&self, role: OptimizerRole) -> Result<&RoleOptimizer, MlError> {
        self.roles
            .get(&role)
            .ok_or_else(|| MlError::not_found(format!("optimizer role '{role}'")))
    }

    /// Clear the gradients of the role's parameters.
    pub fn zero_gradients(&self, role: OptimizerRole, model: &mut dyn Recommender) -> Result<(), MlError> {
        let ro = self.role(role)?;
        for (name, param) in model.parameters_mut() {
            if ro.learning_rate_for(name).is_some() {
                param.zero_grad();
            }
        }
        Ok(())
    }

    /// Clip the role's gradients by global norm; returns the pre-clip norm.
    pub fn clip_gradients(
        &self,
        role: OptimizerRole,
        model: &mut dyn Recommender,
        clip: &ClipGradNorm,
    ) -> Result<f32, MlError> {
        let ro = self.role(role)?;
        let mut params: Vec<&mut Parameter> = model
            .parameters_mut()
            .into_iter()
            .filter(|(name, _)| ro.learning_rate_for(name).is_some())
            .map(|(_, p)| p)
            .collect();
        Ok(clip_grad_norm(&mut params, clip.max_norm, clip.norm_type))
    }

    /// Update every parameter bound to the role.
    pub fn step(&mut self, role: OptimizerRole, model: &mut dyn Recommender) -> Result<(), MlError> {
        let ro = self
            .roles
            .get_mut(&role)
            .ok_or_else(|| MlError::not_found(format!("optimizer role '{role}'")))?;
        for (name, param) in model.parameters_mut() {
            if let Some(lr) = ro.learning_rate_for(name) {
                ro.optimizer.update(name, param, lr)?;
            }
        }
        Ok(())
    }

    pub fn state_snapshot(&self, role: OptimizerRole) -> Result<OptimizerSnapshot, MlError> {
        Ok(self.role(role)?.optimizer.snapshot())
    }

    pub fn restore_state(&mut self, role: OptimizerRole, snapshot: &OptimizerSnapshot) -> Result<(), MlError> {
        let ro = self
            .roles
            .get_mut(&role)
            .ok_or_else(|| MlError::not_found(format!("optimizer role '{role}'")))?;
        ro.optimizer.restore(snapshot)
    }

    /// Snapshots of every role keyed by role name.
    pub fn snapshots(&self) -> BTreeMap<String, OptimizerSnapshot> {
        self.roles
            .iter()
            .map(|(role, ro)| (role.as_str().to_string(), ro.optimizer.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{IxDyn, arr1};

    fn param(value: f32, grad: f32) -> Parameter {
        let mut p = Parameter::new(arr1(&[value]).into_dyn());
        p.grad = Some(arr1(&[grad]).into_dyn());
        p
    }

    fn value(p: &Parameter) -> f32 {
        p.value[IxDyn(&[0])]
    }

    #[test]
    fn test_sgd_step() {
        let mut opt = Optimizer::new(LearnerKind::Sgd, 0.1, 0.0, 0.0);
        let mut p = param(1.0, 0.5);
        opt.update("w", &mut p, 0.1).unwrap();
        assert!((value(&p) - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_weight_decay_is_l2() {
        let mut opt = Optimizer::new(LearnerKind::Sgd, 0.1, 0.1, 0.0);
        let mut p = param(1.0, 0.5);
        opt.update("w", &mut p, 0.1).unwrap();
        assert!((value(&p) - 0.94).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut opt = Optimizer::new(LearnerKind::Sgd, 0.1, 0.0, 0.9);
        let mut p = param(1.0, 1.0);
        opt.update("w", &mut p, 0.1).unwrap();
        opt.update("w", &mut p, 0.1).unwrap();
        // buf = 1, then 0.9 * 1 + 1 = 1.9
        assert!((value(&p) - (1.0 - 0.1 - 0.19)).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut opt = Optimizer::new(LearnerKind::Adam, 0.1, 0.0, 0.0);
        let mut p = param(1.0, 0.5);
        opt.update("w", &mut p, 0.1).unwrap();
        assert!((value(&p) - 0.9).abs() < 1e-5);
        assert_eq!(opt.snapshot().slots["w"].step, 1);
    }

    #[test]
    fn test_adagrad_and_rmsprop_decrease_loss_direction() {
        for kind in [LearnerKind::Adagrad, LearnerKind::RmsProp] {
            let mut opt = Optimizer::new(kind, 0.01, 0.0, 0.0);
            let mut p = param(1.0, 2.0);
            opt.update("w", &mut p, 0.01).unwrap();
            assert!(value(&p) < 1.0, "{kind:?} should descend");
        }
    }

    #[test]
    fn test_sparse_adam_skips_zero_gradients() {
        let mut opt = Optimizer::new(LearnerKind::SparseAdam, 0.1, 0.0, 0.0);
        let mut p = param(1.0, 0.0);
        opt.update("w", &mut p, 0.1).unwrap();
        assert_eq!(value(&p), 1.0);
    }

    #[test]
    fn test_no_grad_is_noop() {
        let mut opt = Optimizer::new(LearnerKind::Adam, 0.1, 0.0, 0.0);
        let mut p = Parameter::new(arr1(&[1.0]).into_dyn());
        opt.update("w", &mut p, 0.1).unwrap();
        assert_eq!(value(&p), 1.0);
        assert!(opt.snapshot().slots.is_empty());
    }

    #[test]
    fn test_unknown_learner_falls_back_to_adam() {
        let config = TrainerConfig {
            learner: "lion".into(),
            weight_decay: 0.5,
            ..Default::default()
        };
        let opt = Optimizer::from_config(&config);
        assert_eq!(opt.kind(), LearnerKind::Adam);
        assert_eq!(opt.weight_decay, 0.0);
    }

    #[test]
    fn test_learner_names_case_insensitive() {
        assert_eq!(LearnerKind::parse("RMSprop"), Some(LearnerKind::RmsProp));
        assert_eq!(LearnerKind::parse("SGD"), Some(LearnerKind::Sgd));
        assert_eq!(LearnerKind::parse("nadam"), None);
    }

    #[test]
    fn test_restore_rejects_other_kind() {
        let mut adam = Optimizer::new(LearnerKind::Adam, 0.1, 0.0, 0.0);
        let sgd = Optimizer::new(LearnerKind::Sgd, 0.1, 0.0, 0.0);
        assert!(matches!(adam.restore(&sgd.snapshot()), Err(MlError::Checkpoint(_))));
    }

    #[test]
    fn test_group_matching() {
        assert!(group_matches("filter_layer", "filter_layer"));
        assert!(group_matches("filter_layer", "filter_layer.weight"));
        assert!(!group_matches("filter_layer", "filter_layer_dict.gender.weight"));
        assert!(group_matches(ALL_PARAMETERS, "anything"));
    }
}
