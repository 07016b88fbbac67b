//! The training state machine: epochs, stages, validation, checkpoints.

use crate::attributes::SensitiveAttributeSet;
use crate::config::{FinetuneScorePolicy, TrainerConfig};
use crate::data::{DatasetMeta, EvalDataLoader, TrainDataLoader};
use crate::error::MlError;
use crate::eval::{
    EvaluationEngine, EvaluationResult, MetricCollector, MetricEvaluator, MetricMap,
    calculate_valid_score, prefixed,
};
use crate::model::{Loss, ModelMode, Recommender, TrainStage};
use crate::training::checkpoint::{CHECKPOINT_FORMAT_VERSION, Checkpoint, CheckpointStore};
use crate::training::early_stopping::{EarlyStoppingController, ScoreDirection};
use crate::training::embeddings::{
    export_embeddings, masked_file_name, plain_file_name, pretrain_file_name, staged_file_name,
    unfiltered_file_name,
};
use crate::training::mask::MaskSampler;
use crate::training::observer::{TracingObserver, TrainingObserver};
use crate::training::optim::{OptimizerRole, OptimizerSet};
use crate::training::plan::{LossKind, TrainingPlan, TrainingVariant};
use crate::training::session::TrainingSession;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Options for [`TrainingOrchestrator::fit`].
pub struct FitOptions<'a> {
    /// Persist checkpoints on improvement (or every epoch without validation).
    pub saved: bool,
    /// Called with `(epoch, valid_score)` after every validation.
    pub callback: Option<&'a mut dyn FnMut(usize, f64)>,
}

impl Default for FitOptions<'_> {
    fn default() -> Self {
        Self {
            saved: true,
            callback: None,
        }
    }
}

/// Best validation score and result of a run; both `None` without validation.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub best_score: Option<f64>,
    pub best_result: Option<EvaluationResult>,
}

/// Options for [`TrainingOrchestrator::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateOptions {
    /// Reload the saved best checkpoint before evaluating.
    pub load_best_model: bool,
    /// Checkpoint to load instead of the run's own.
    pub model_file: Option<PathBuf>,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            load_best_model: true,
            model_file: None,
        }
    }
}

/// Where an epoch loop persists its checkpoints.
enum SaveTarget {
    Session,
    Pretrain(PathBuf),
}

/// Drives training and evaluation of one model.
pub struct TrainingOrchestrator<M: Recommender> {
    config: TrainerConfig,
    plan: TrainingPlan,
    model: M,
    optimizers: OptimizerSet,
    session: TrainingSession,
    attributes: SensitiveAttributeSet,
    sampler: MaskSampler,
    early_stopping: EarlyStoppingController,
    checkpoints: CheckpointStore,
    engine: EvaluationEngine,
    observer: Box<dyn TrainingObserver>,
    pretrain_checkpoint: Option<PathBuf>,
}

impl<M: Recommender> TrainingOrchestrator<M> {
    pub fn new(
        config: TrainerConfig,
        mut model: M,
        collector: Box<dyn MetricCollector>,
        evaluator: Box<dyn MetricEvaluator>,
    ) -> Result<Self, MlError> {
        config.validate()?;
        let plan = TrainingPlan::for_model(&config)?;
        model.to_device(&config.device)?;

        let optimizers = OptimizerSet::build(&plan, &config);
        optimizers.verify(&model);

        let session = TrainingSession::new(plan.initial_stage);
        model.set_train_stage(session.stage);

        let mut pretrain_checkpoint = None;
        if let Some(path) = &config.pretrain_model_file_path {
            let checkpoint = CheckpointStore::load(path)?;
            model.load_state_dict(&checkpoint.state_dict)?;
            model.load_other_parameter(checkpoint.other_parameter.as_ref())?;
            info!(
                path = %path.display(),
                "Loading pretrain model structure and parameters"
            );
            pretrain_checkpoint = Some(path.clone());
        }

        let early_stopping = EarlyStoppingController::new(
            config.stopping_step,
            ScoreDirection::from_bigger(config.valid_metric_bigger),
        );

        debug!(
            model = %config.model,
            variant = ?plan.variant,
            stage = %session.stage,
            roles = plan.roles.len(),
            "orchestrator ready"
        );

        Ok(Self {
            attributes: SensitiveAttributeSet::new(config.sst_attr_list.iter().cloned()),
            sampler: MaskSampler::new(config.seed),
            checkpoints: CheckpointStore::new(&config.checkpoint_dir, &config.model),
            engine: EvaluationEngine::new(&config, collector, evaluator),
            observer: Box::new(TracingObserver::new(config.loss_decimal_place)),
            early_stopping,
            optimizers,
            session,
            plan,
            model,
            config,
            pretrain_checkpoint,
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn TrainingObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn plan(&self) -> &TrainingPlan {
        &self.plan
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn optimizers(&self) -> &OptimizerSet {
        &self.optimizers
    }

    /// The run's default checkpoint file.
    pub fn checkpoint_path(&self) -> &Path {
        self.checkpoints.path()
    }

    /// The pretrain checkpoint, once pretraining ran or one was supplied.
    pub fn pretrain_checkpoint(&self) -> Option<&Path> {
        self.pretrain_checkpoint.as_deref()
    }

    /// Train until the epoch budget is spent or early stopping fires.
    pub fn fit(
        &mut self,
        train: &mut dyn TrainDataLoader,
        mut valid: Option<&mut (dyn EvalDataLoader + '_)>,
        mut options: FitOptions<'_>,
    ) -> Result<FitOutcome, MlError> {
        self.engine.collect_training_data(train.dataset());

        if self.is_staged() && self.session.stage == TrainStage::Pretrain {
            self.pretrain(train, valid.as_deref_mut(), options.saved)?;
            self.transition_to_finetune();
        }

        self.run_epochs(
            train,
            valid.as_deref_mut(),
            self.config.epochs,
            &SaveTarget::Session,
            options.saved,
            options.callback.as_deref_mut(),
        )?;

        if self.config.save_sst_embed {
            self.export_sensitive_embeddings(train.dataset())?;
        }

        Ok(FitOutcome {
            best_score: self.session.best_score,
            best_result: self.session.best_result.clone(),
        })
    }

    /// Evaluate on `eval`. An empty loader yields an empty result.
    pub fn evaluate(
        &mut self,
        eval: &mut dyn EvalDataLoader,
        options: EvaluateOptions,
    ) -> Result<EvaluationResult, MlError> {
        if eval.is_empty() {
            return Ok(EvaluationResult::empty());
        }
        let best_path = options
            .model_file
            .clone()
            .unwrap_or_else(|| self.checkpoints.path().to_path_buf());

        if self.is_staged() && options.load_best_model {
            let mut merged = MetricMap::new();
            if !self.config.load_pretrain_weight {
                if let Some(pretrain) = self.pretrain_checkpoint.clone() {
                    self.load_model_state(&pretrain)?;
                    self.model.set_train_stage(TrainStage::Pretrain);
                    let metrics = self.engine.evaluate(&mut self.model, eval, None)?;
                    merged.extend(prefixed("pretrain-", &metrics));
                }
            }
            self.load_model_state(&best_path)?;
            self.model.set_train_stage(TrainStage::Finetune);
            let metrics = self.engine.evaluate(&mut self.model, eval, None)?;
            merged.extend(prefixed("finetune-", &metrics));
            return Ok(EvaluationResult::Metrics(merged));
        }

        if options.load_best_model {
            self.load_model_state(&best_path)?;
        }

        match self.plan.variant {
            TrainingVariant::MaskedAdversarial { .. } => {
                let groups = self.engine.evaluate_subsets(
                    &mut self.model,
                    eval,
                    &self.attributes,
                    &self.config.filter_mode,
                )?;
                Ok(EvaluationResult::Grouped(groups))
            }
            TrainingVariant::Plain if self.plan.kind.is_pfcn() => {
                let metrics = self.engine.evaluate(&mut self.model, eval, None)?;
                Ok(EvaluationResult::Grouped(vec![(
                    self.config.filter_mode.clone(),
                    metrics,
                )]))
            }
            _ => {
                let metrics = self.engine.evaluate(&mut self.model, eval, None)?;
                Ok(EvaluationResult::Metrics(metrics))
            }
        }
    }

    /// Restore counters, parameters and optimizer state from `path`.
    pub fn resume(&mut self, path: &Path) -> Result<(), MlError> {
        let checkpoint = CheckpointStore::load(path)?;
        self.checkpoints.set_path(path);

        if !checkpoint.model.eq_ignore_ascii_case(&self.config.model) {
            warn!(
                checkpoint_model = %checkpoint.model,
                configured_model = %self.config.model,
                "Architecture configuration given in config file is different from that of checkpoint. \
                 This may yield an exception while state_dict is being loaded."
            );
            self.observer
                .on_model_mismatch(&checkpoint.model, &self.config.model);
        } else if checkpoint.fingerprint != self.config.fingerprint()? {
            debug!("checkpoint was written with a different configuration");
        }

        self.session.stage = checkpoint.stage;
        self.session.epoch = checkpoint.next_epoch();
        self.session.step = checkpoint.step;
        self.session.best_score = checkpoint.best_score;
        self.early_stopping.restore(checkpoint.best_score, checkpoint.step);
        self.model.set_train_stage(checkpoint.stage);

        self.model.load_state_dict(&checkpoint.state_dict)?;
        self.model
            .load_other_parameter(checkpoint.other_parameter.as_ref())?;

        let roles: Vec<OptimizerRole> = self.optimizers.roles().collect();
        for role in roles {
            match checkpoint.optimizers.get(role.as_str()) {
                Some(snapshot) => self.optimizers.restore_state(role, snapshot)?,
                None => warn!(role = %role, "checkpoint holds no optimizer state for role"),
            }
        }

        info!(
            path = %path.display(),
            "Checkpoint loaded. Resume training from epoch {}",
            self.session.epoch
        );
        Ok(())
    }

    /// Capture the full recoverable state, tagged with `epoch`.
    pub fn snapshot(&self, epoch: i64) -> Result<Checkpoint, MlError> {
        Ok(Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            model: self.config.model.clone(),
            fingerprint: self.config.fingerprint()?,
            config: self.config.clone(),
            stage: self.session.stage,
            epoch,
            step: self.session.step,
            best_score: self.session.best_score,
            state_dict: self.model.state_dict(),
            other_parameter: self.model.other_parameter(),
            optimizers: self.optimizers.snapshots(),
            created_at: Utc::now(),
        })
    }

    fn is_staged(&self) -> bool {
        matches!(self.plan.variant, TrainingVariant::StagedAdversarial { .. })
    }

    fn pretrain(
        &mut self,
        train: &mut dyn TrainDataLoader,
        valid: Option<&mut (dyn EvalDataLoader + '_)>,
        saved: bool,
    ) -> Result<(), MlError> {
        let TrainingVariant::StagedAdversarial { pretrain_epochs, .. } = self.plan.variant else {
            return Ok(());
        };
        let path = self.checkpoints.sibling(&format!(
            "{}-{}-pretrain.json",
            self.config.model, self.config.dataset
        ));
        info!(epochs = pretrain_epochs, "Model Pretrain");

        self.run_epochs(
            train,
            valid,
            pretrain_epochs,
            &SaveTarget::Pretrain(path.clone()),
            saved,
            None,
        )?;

        if path.exists() {
            self.load_model_state(&path)?;
            self.pretrain_checkpoint = Some(path);
        } else {
            debug!(path = %path.display(), "no pretrain checkpoint written, keeping current state");
        }

        if self.config.save_sst_embed {
            let users = train.dataset().user_features_without_padding()?;
            self.model.set_mode(ModelMode::Eval);
            let file = self
                .checkpoints
                .sibling(&pretrain_file_name(&self.config.model, &self.config.dataset));
            export_embeddings(&self.model, &users, None, &file)?;
        }
        Ok(())
    }

    fn transition_to_finetune(&mut self) {
        let carried_score = self.session.best_score;
        let carried_result = self.session.best_result.take();
        self.session.reset(TrainStage::Finetune);
        self.early_stopping.reset();
        if self.config.finetune_score_policy == FinetuneScorePolicy::Carry {
            self.session.best_score = carried_score;
            self.session.best_result = carried_result;
            self.early_stopping.restore(carried_score, 0);
        }
        self.model.set_train_stage(TrainStage::Finetune);
        self.observer
            .on_stage_transition(TrainStage::Pretrain, TrainStage::Finetune);
    }

    fn run_epochs(
        &mut self,
        train: &mut dyn TrainDataLoader,
        mut valid: Option<&mut (dyn EvalDataLoader + '_)>,
        total_epochs: usize,
        target: &SaveTarget,
        saved: bool,
        mut callback: Option<&mut (dyn FnMut(usize, f64) + '_)>,
    ) -> Result<(), MlError> {
        if saved && matches!(target, SaveTarget::Session) && self.session.epoch >= total_epochs {
            self.save_checkpoint(-1, target)?;
        }

        let eval_step = self.config.eval_step.min(total_epochs);
        let has_valid = valid.as_ref().is_some_and(|v| !v.is_empty());
        let stage = self.session.stage;

        for epoch in self.session.epoch..total_epochs {
            self.observer.on_epoch_start(stage, epoch);
            let started = Instant::now();
            let loss = self.train_epoch(train, epoch)?;
            self.observer
                .on_epoch_end(stage, epoch, &loss, started.elapsed());
            self.session.record_loss(epoch, loss);
            self.session.epoch = epoch + 1;

            let valid_loader = match valid.as_deref_mut() {
                Some(v) if has_valid && eval_step > 0 => v,
                _ => {
                    if saved {
                        self.save_checkpoint(epoch as i64, target)?;
                    }
                    continue;
                }
            };
            if (epoch + 1) % eval_step != 0 {
                continue;
            }

            self.observer.on_eval_start(epoch);
            let started = Instant::now();
            let (score, result) = self.valid_epoch(valid_loader)?;
            let decision = self.early_stopping.update(score);
            self.session.best_score = decision.best;
            self.session.step = decision.step;
            self.observer
                .on_eval_end(epoch, score, &result, started.elapsed());

            if decision.improved {
                if saved {
                    self.save_checkpoint(epoch as i64, target)?;
                }
                self.session.best_result = Some(result);
            }

            if let Some(callback) = callback.as_deref_mut() {
                callback(epoch, score);
            }

            if decision.stop {
                let best_epoch = epoch.saturating_sub(self.session.step * eval_step);
                self.observer.on_training_stopped(stage, best_epoch);
                break;
            }
        }
        Ok(())
    }

    fn train_epoch(&mut self, train: &mut dyn TrainDataLoader, epoch: usize) -> Result<Loss, MlError> {
        self.model.set_mode(ModelMode::Train);
        match (self.plan.variant, self.session.stage) {
            (TrainingVariant::Plain, _) => {
                let loss = self.train_pass(train, epoch, OptimizerRole::Base, None)?;
                if self.config.ips_norm {
                    self.model.normalize_ips()?;
                }
                Ok(loss)
            }
            (TrainingVariant::StagedAdversarial { .. }, TrainStage::Pretrain) => {
                self.train_pass(train, epoch, OptimizerRole::Pretrain, None)
            }
            (
                TrainingVariant::MaskedAdversarial { filter_interval }
                | TrainingVariant::StagedAdversarial {
                    filter_interval, ..
                },
                _,
            ) => {
                let mask = self.sampler.sample(self.attributes.len())?;
                let revealed = self.attributes.revealed(&mask)?;
                trace!(epoch, revealed = ?revealed, "sampled attribute mask");

                let filter_loss = if epoch % filter_interval == 0 {
                    self.train_pass(train, epoch, OptimizerRole::Filter, Some(revealed.as_slice()))?
                        .total()
                } else {
                    0.0
                };
                let dis_loss = self
                    .train_pass(train, epoch, OptimizerRole::Discriminator, Some(revealed.as_slice()))?
                    .total();
                // Staged models report the discriminator first.
                match self.plan.variant {
                    TrainingVariant::StagedAdversarial { .. } => {
                        Ok(Loss::Components(vec![dis_loss, filter_loss]))
                    }
                    _ => Ok(Loss::Components(vec![filter_loss, dis_loss])),
                }
            }
        }
    }

    /// One pass over the training data stepping `role` after every batch.
    fn train_pass(
        &mut self,
        train: &mut dyn TrainDataLoader,
        epoch: usize,
        role: OptimizerRole,
        revealed: Option<&[String]>,
    ) -> Result<Loss, MlError> {
        let loss_kind = self.plan.loss_for(role);
        let clip = self.config.clip_grad_norm;
        let mut total: Option<Loss> = None;

        for (batch_idx, batch) in train.batches().enumerate() {
            let batch = batch?;
            self.optimizers.zero_gradients(role, &mut self.model)?;
            let loss = match loss_kind {
                LossKind::Recommendation => self.model.calculate_loss(&batch, revealed)?,
                LossKind::Discriminator => {
                    self.model.calculate_discriminator_loss(&batch, revealed)?
                }
            };
            if loss.is_nan() {
                return Err(MlError::Divergence {
                    epoch,
                    batch: batch_idx,
                });
            }
            self.model.backward(&loss)?;
            if let Some(clip) = &clip {
                self.optimizers
                    .clip_gradients(role, &mut self.model, clip)?;
            }
            self.optimizers.step(role, &mut self.model)?;
            if self.config.show_progress {
                trace!(epoch, batch = batch_idx, role = %role, loss = loss.total(), "train batch");
            }

            total = Some(match total.take() {
                Some(mut acc) => {
                    acc.accumulate(&loss)?;
                    acc
                }
                None => loss,
            });
        }

        self.observer.on_train_pass(epoch, role);
        Ok(total.unwrap_or(Loss::Scalar(0.0)))
    }

    fn valid_epoch(&mut self, valid: &mut dyn EvalDataLoader) -> Result<(f64, EvaluationResult), MlError> {
        let metrics = match self.plan.variant {
            TrainingVariant::MaskedAdversarial { .. } => {
                self.engine
                    .evaluate_pooled(&mut self.model, valid, &self.attributes)?
            }
            _ => self.engine.evaluate(&mut self.model, valid, None)?,
        };
        let score = calculate_valid_score(&metrics, &self.config.valid_metric)?;
        Ok((score, EvaluationResult::Metrics(metrics)))
    }

    fn save_checkpoint(&mut self, epoch: i64, target: &SaveTarget) -> Result<PathBuf, MlError> {
        let checkpoint = self.snapshot(epoch)?;
        let path = match target {
            SaveTarget::Session => self.checkpoints.save(&checkpoint)?,
            SaveTarget::Pretrain(path) => {
                self.checkpoints.save_to(path, &checkpoint)?;
                path.clone()
            }
        };
        self.observer.on_checkpoint_saved(epoch, &path);
        Ok(path)
    }

    fn load_model_state(&mut self, path: &Path) -> Result<(), MlError> {
        let checkpoint = CheckpointStore::load(path)?;
        self.model.load_state_dict(&checkpoint.state_dict)?;
        self.model
            .load_other_parameter(checkpoint.other_parameter.as_ref())?;
        info!(path = %path.display(), "Loading model structure and parameters");
        Ok(())
    }

    /// Reload the run's best checkpoint when one was written.
    fn reload_best(&mut self) -> Result<(), MlError> {
        let path = self.checkpoints.path().to_path_buf();
        if path.exists() {
            self.load_model_state(&path)?;
        }
        Ok(())
    }

    fn export_sensitive_embeddings(&mut self, dataset: &DatasetMeta) -> Result<(), MlError> {
        let users = dataset.user_features_without_padding()?;
        let model_name = self.config.model.clone();

        match self.plan.variant {
            TrainingVariant::StagedAdversarial { .. } => {
                self.model.set_mode(ModelMode::Eval);
                let attrs = self.attributes.names().to_vec();
                let file = self.checkpoints.sibling(&staged_file_name(
                    &model_name,
                    &self.config.aggr_method,
                    &attrs,
                ));
                export_embeddings(&self.model, &users, Some(attrs.as_slice()), &file)
            }
            TrainingVariant::MaskedAdversarial { .. } => {
                self.reload_best()?;
                self.model.set_mode(ModelMode::Eval);
                for subset in self.attributes.non_empty_subsets() {
                    let file = self.checkpoints.sibling(&masked_file_name(
                        &model_name,
                        &self.config.filter_mode,
                        &subset,
                    ));
                    export_embeddings(&self.model, &users, Some(subset.as_slice()), &file)?;
                }
                Ok(())
            }
            TrainingVariant::Plain => {
                self.reload_best()?;
                self.model.set_mode(ModelMode::Eval);
                let file_name = if self.plan.kind.is_pfcn() {
                    unfiltered_file_name(&model_name, &self.config.filter_mode)
                } else {
                    plain_file_name(&model_name)
                };
                export_embeddings(&self.model, &users, None, &self.checkpoints.sibling(&file_name))
            }
        }
    }
}
