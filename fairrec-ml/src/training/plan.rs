//! Capability descriptor: which training routine a model kind runs, which
//! parameters each optimizer role steps, and which loss drives each role.

use crate::config::{ParamGroupConfig, TrainerConfig};
use crate::error::MlError;
use crate::model::TrainStage;
use crate::training::optim::{ALL_PARAMETERS, OptimizerRole};
use serde::{Deserialize, Serialize};

/// Model families with a preset role table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    FairGoPmf,
    FairGoGcn,
    PfcnMlp,
    PfcnBiasedMf,
    PfcnDmf,
    PfcnPmf,
    General,
}

impl ModelKind {
    pub fn parse(model: &str) -> Self {
        match model.to_ascii_lowercase().as_str() {
            "fairgo_pmf" => Self::FairGoPmf,
            "fairgo_gcn" => Self::FairGoGcn,
            "pfcn_mlp" => Self::PfcnMlp,
            "pfcn_biasedmf" => Self::PfcnBiasedMf,
            "pfcn_dmf" => Self::PfcnDmf,
            "pfcn_pmf" => Self::PfcnPmf,
            _ => Self::General,
        }
    }

    pub fn is_fairgo(&self) -> bool {
        matches!(self, Self::FairGoPmf | Self::FairGoGcn)
    }

    pub fn is_pfcn(&self) -> bool {
        matches!(
            self,
            Self::PfcnMlp | Self::PfcnBiasedMf | Self::PfcnDmf | Self::PfcnPmf
        )
    }

    /// Whether training needs a non-empty sensitive attribute list.
    pub fn requires_attributes(&self, filter_enabled: bool) -> bool {
        self.is_fairgo() || (self.is_pfcn() && filter_enabled)
    }
}

/// Which epoch routine the orchestrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingVariant {
    /// One role, one loss, every batch.
    Plain,
    /// Random attribute mask per epoch; filter every `filter_interval`
    /// epochs, discriminator every epoch.
    MaskedAdversarial { filter_interval: usize },
    /// Plain pretraining for `pretrain_epochs`, then masked adversarial finetuning.
    StagedAdversarial {
        filter_interval: usize,
        pretrain_epochs: usize,
    },
}

/// The loss a role optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    Recommendation,
    Discriminator,
}

/// One row of the role table.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleSpec {
    pub role: OptimizerRole,
    pub groups: Vec<ParamGroupConfig>,
    pub loss: LossKind,
}

impl RoleSpec {
    fn new(role: OptimizerRole, prefixes: &[&str], loss: LossKind) -> Self {
        Self {
            role,
            groups: prefixes
                .iter()
                .map(|p| ParamGroupConfig {
                    prefix: (*p).to_string(),
                    learning_rate: None,
                })
                .collect(),
            loss,
        }
    }
}

/// Declarative description of how a model is trained.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPlan {
    pub kind: ModelKind,
    pub variant: TrainingVariant,
    pub roles: Vec<RoleSpec>,
    pub initial_stage: TrainStage,
}

impl TrainingPlan {
    pub fn for_model(config: &TrainerConfig) -> Result<Self, MlError> {
        let kind = ModelKind::parse(&config.model);
        let filter_interval = config.train_epoch_interval.max(1);

        let (variant, initial_stage) = if kind.is_fairgo() {
            let stage = if config.load_pretrain_weight || config.pretrain_model_file_path.is_some() {
                TrainStage::Finetune
            } else {
                TrainStage::Pretrain
            };
            (
                TrainingVariant::StagedAdversarial {
                    filter_interval,
                    pretrain_epochs: config.pretrain_epochs,
                },
                stage,
            )
        } else if kind.is_pfcn() && config.filter_enabled() {
            (
                TrainingVariant::MaskedAdversarial { filter_interval },
                TrainStage::Finetune,
            )
        } else {
            (TrainingVariant::Plain, TrainStage::Finetune)
        };

        let roles = if config.optimizer_roles.is_empty() {
            preset_roles(kind, variant, initial_stage, &config.aggr_method)
        } else {
            override_roles(config)?
        };

        let plan = Self {
            kind,
            variant,
            roles,
            initial_stage,
        };
        plan.check_required_roles()?;
        Ok(plan)
    }

    pub fn role(&self, role: OptimizerRole) -> Option<&RoleSpec> {
        self.roles.iter().find(|r| r.role == role)
    }

    pub fn loss_for(&self, role: OptimizerRole) -> LossKind {
        self.role(role)
            .map_or(LossKind::Recommendation, |r| r.loss)
    }

    pub fn is_adversarial(&self) -> bool {
        !matches!(self.variant, TrainingVariant::Plain)
    }

    fn required_roles(&self) -> Vec<OptimizerRole> {
        match self.variant {
            TrainingVariant::Plain => vec![OptimizerRole::Base],
            TrainingVariant::MaskedAdversarial { .. } => {
                vec![OptimizerRole::Filter, OptimizerRole::Discriminator]
            }
            TrainingVariant::StagedAdversarial { .. } => {
                let mut roles = vec![OptimizerRole::Filter, OptimizerRole::Discriminator];
                if self.initial_stage == TrainStage::Pretrain {
                    roles.push(OptimizerRole::Pretrain);
                }
                roles
            }
        }
    }

    fn check_required_roles(&self) -> Result<(), MlError> {
        for role in self.required_roles() {
            if self.role(role).is_none() {
                return Err(MlError::config(format!(
                    "model kind {:?} needs an optimizer role '{role}'",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}

fn preset_roles(
    kind: ModelKind,
    variant: TrainingVariant,
    stage: TrainStage,
    aggr_method: &str,
) -> Vec<RoleSpec> {
    use LossKind::{Discriminator, Recommendation};
    use OptimizerRole::{Base, Filter, Pretrain};

    let mut discriminator = vec!["dis_layer_dict"];
    if kind.is_fairgo() && aggr_method == "LBA" {
        discriminator.push("aggr_layer");
    }
    let dis = RoleSpec::new(OptimizerRole::Discriminator, &discriminator, Discriminator);

    match (kind, variant) {
        (_, TrainingVariant::Plain) => vec![RoleSpec::new(Base, &[ALL_PARAMETERS], Recommendation)],
        (ModelKind::FairGoPmf | ModelKind::FairGoGcn, _) => {
            let mut roles = Vec::new();
            if stage == TrainStage::Pretrain {
                let mut pretrain = vec!["user_embedding_layer", "item_embedding_layer"];
                if kind == ModelKind::FairGoGcn {
                    pretrain.push("gcn");
                }
                roles.push(RoleSpec::new(Pretrain, &pretrain, Recommendation));
            }
            roles.push(RoleSpec::new(Filter, &["filter_layer_dict"], Recommendation));
            roles.push(dis);
            roles
        }
        (ModelKind::PfcnMlp, _) => vec![
            RoleSpec::new(
                Filter,
                &["user_embedding", "item_embedding", "filter_layer", "mlp_layer"],
                Recommendation,
            ),
            dis,
        ],
        (ModelKind::PfcnBiasedMf, _) => vec![
            RoleSpec::new(
                Filter,
                &[
                    "user_embedding_layer",
                    "item_embedding_layer",
                    "filter_layer",
                    "user_bias",
                    "item_bias",
                    "global_bias",
                ],
                Recommendation,
            ),
            dis,
        ],
        (ModelKind::PfcnDmf, _) => vec![
            RoleSpec::new(
                Filter,
                &[
                    "user_embedding_layer",
                    "item_embedding_layer",
                    "filter_layer",
                    "user_mlp",
                    "item_mlp",
                ],
                Recommendation,
            ),
            dis,
        ],
        (ModelKind::PfcnPmf, _) => vec![
            RoleSpec::new(
                Filter,
                &["user_embedding_layer", "item_embedding_layer", "filter_layer"],
                Recommendation,
            ),
            dis,
        ],
        (ModelKind::General, _) => vec![RoleSpec::new(Base, &[ALL_PARAMETERS], Recommendation)],
    }
}

fn override_roles(config: &TrainerConfig) -> Result<Vec<RoleSpec>, MlError> {
    config
        .optimizer_roles
        .iter()
        .map(|(name, groups)| {
            let role = OptimizerRole::parse(name)
                .ok_or_else(|| MlError::config(format!("unknown optimizer role '{name}'")))?;
            let loss = if role == OptimizerRole::Discriminator {
                LossKind::Discriminator
            } else {
                LossKind::Recommendation
            };
            Ok(RoleSpec {
                role,
                groups: groups.clone(),
                loss,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn config(model: &str) -> TrainerConfig {
        TrainerConfig {
            model: model.into(),
            sst_attr_list: vec!["gender".into(), "age".into()],
            ..Default::default()
        }
    }

    fn prefixes(plan: &TrainingPlan, role: OptimizerRole) -> Vec<String> {
        plan.role(role)
            .unwrap()
            .groups
            .iter()
            .map(|g| g.prefix.clone())
            .collect()
    }

    #[test]
    fn test_general_model_is_plain() {
        let plan = TrainingPlan::for_model(&config("BPR")).unwrap();
        assert_eq!(plan.kind, ModelKind::General);
        assert_eq!(plan.variant, TrainingVariant::Plain);
        assert_eq!(prefixes(&plan, OptimizerRole::Base), vec![ALL_PARAMETERS]);
        assert!(!plan.is_adversarial());
    }

    #[test]
    fn test_fairgo_gcn_pretrains_embeddings_and_gcn() {
        let mut cfg = config("FairGo_GCN");
        cfg.pretrain_epochs = 5;
        cfg.aggr_method = "LBA".into();
        let plan = TrainingPlan::for_model(&cfg).unwrap();
        assert_eq!(plan.initial_stage, TrainStage::Pretrain);
        assert_eq!(
            plan.variant,
            TrainingVariant::StagedAdversarial {
                filter_interval: 1,
                pretrain_epochs: 5
            }
        );
        assert_eq!(
            prefixes(&plan, OptimizerRole::Pretrain),
            vec!["user_embedding_layer", "item_embedding_layer", "gcn"]
        );
        assert_eq!(
            prefixes(&plan, OptimizerRole::Discriminator),
            vec!["dis_layer_dict", "aggr_layer"]
        );
        assert_eq!(plan.loss_for(OptimizerRole::Discriminator), LossKind::Discriminator);
    }

    #[test]
    fn test_fairgo_with_pretrained_weights_starts_in_finetune() {
        let mut cfg = config("FairGo_PMF");
        cfg.pretrain_model_file_path = Some(PathBuf::from("saved/pretrain.json"));
        let plan = TrainingPlan::for_model(&cfg).unwrap();
        assert_eq!(plan.initial_stage, TrainStage::Finetune);
        assert!(plan.role(OptimizerRole::Pretrain).is_none());
    }

    #[test]
    fn test_pfcn_filter_mode_selects_variant() {
        let mut cfg = config("PFCN_BiasedMF");
        cfg.filter_mode = "SM".into();
        cfg.train_epoch_interval = 3;
        let plan = TrainingPlan::for_model(&cfg).unwrap();
        assert_eq!(
            plan.variant,
            TrainingVariant::MaskedAdversarial { filter_interval: 3 }
        );
        assert!(prefixes(&plan, OptimizerRole::Filter).contains(&"global_bias".to_string()));

        cfg.filter_mode = "none".into();
        let plan = TrainingPlan::for_model(&cfg).unwrap();
        assert_eq!(plan.variant, TrainingVariant::Plain);
    }

    #[test]
    fn test_role_override_replaces_preset() {
        let mut cfg = config("PFCN_MLP");
        cfg.filter_mode = "CM".into();
        cfg.optimizer_roles.insert(
            "filter".into(),
            vec![ParamGroupConfig {
                prefix: "filter_layer".into(),
                learning_rate: Some(0.01),
            }],
        );
        // Masked adversarial training also needs a discriminator role.
        assert!(TrainingPlan::for_model(&cfg).is_err());

        cfg.optimizer_roles.insert(
            "discriminator".into(),
            vec![ParamGroupConfig {
                prefix: "dis_layer_dict".into(),
                learning_rate: None,
            }],
        );
        let plan = TrainingPlan::for_model(&cfg).unwrap();
        assert_eq!(prefixes(&plan, OptimizerRole::Filter), vec!["filter_layer"]);

        cfg.optimizer_roles.insert("critic".into(), Vec::new());
        assert!(matches!(TrainingPlan::for_model(&cfg), Err(MlError::Config(_))));
    }

    #[test]
    fn test_requires_attributes() {
        assert!(ModelKind::FairGoPmf.requires_attributes(false));
        assert!(ModelKind::PfcnDmf.requires_attributes(true));
        assert!(!ModelKind::PfcnDmf.requires_attributes(false));
        assert!(!ModelKind::General.requires_attributes(true));
    }
}
