//! Observers notified at fixed points of the training loop.
//!
//! Logging and progress reporting hang off these hooks so the loop itself
//! never formats output.

use crate::eval::EvaluationResult;
use crate::model::{Loss, TrainStage};
use crate::training::optim::OptimizerRole;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Hooks invoked by the orchestrator. Every method defaults to a no-op.
pub trait TrainingObserver {
    fn on_epoch_start(&mut self, _stage: TrainStage, _epoch: usize) {}

    /// One role finished a pass over the training data.
    fn on_train_pass(&mut self, _epoch: usize, _role: OptimizerRole) {}

    fn on_epoch_end(&mut self, _stage: TrainStage, _epoch: usize, _loss: &Loss, _elapsed: Duration) {}

    fn on_eval_start(&mut self, _epoch: usize) {}

    fn on_eval_end(
        &mut self,
        _epoch: usize,
        _score: f64,
        _result: &EvaluationResult,
        _elapsed: Duration,
    ) {
    }

    /// `epoch` is `-1` for the marker saved before any training.
    fn on_checkpoint_saved(&mut self, _epoch: i64, _path: &Path) {}

    fn on_stage_transition(&mut self, _from: TrainStage, _to: TrainStage) {}

    /// A resumed checkpoint names a different model than the configuration.
    fn on_model_mismatch(&mut self, _checkpoint_model: &str, _configured_model: &str) {}

    fn on_training_stopped(&mut self, _stage: TrainStage, _best_epoch: usize) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TrainingObserver for NoopObserver {}

/// Renders events as `tracing` records.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    decimal_places: usize,
}

impl TracingObserver {
    pub fn new(decimal_places: usize) -> Self {
        Self { decimal_places }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TrainingObserver for TracingObserver {
    fn on_train_pass(&mut self, epoch: usize, role: OptimizerRole) {
        match role {
            OptimizerRole::Filter => info!(epoch, "Train Filter"),
            OptimizerRole::Discriminator => info!(epoch, "Train Discriminator"),
            _ => {}
        }
    }

    fn on_epoch_end(&mut self, stage: TrainStage, epoch: usize, loss: &Loss, elapsed: Duration) {
        info!(
            stage = %stage,
            epoch,
            elapsed_secs = elapsed.as_secs_f64(),
            "epoch {epoch} training [time: {:.2}s, {}]",
            elapsed.as_secs_f64(),
            loss.describe(self.decimal_places)
        );
    }

    fn on_eval_end(&mut self, epoch: usize, score: f64, result: &EvaluationResult, elapsed: Duration) {
        info!(
            epoch,
            valid_score = score,
            "epoch {epoch} evaluating [time: {:.2}s, valid_score: {score:.6}]",
            elapsed.as_secs_f64()
        );
        info!("valid result: {}", result.describe());
    }

    fn on_checkpoint_saved(&mut self, epoch: i64, path: &Path) {
        info!(epoch, path = %path.display(), "Saving current");
    }

    fn on_stage_transition(&mut self, from: TrainStage, to: TrainStage) {
        info!(from = %from, to = %to, "switching training stage");
    }

    fn on_training_stopped(&mut self, stage: TrainStage, best_epoch: usize) {
        match stage {
            TrainStage::Pretrain => {
                info!(best_epoch, "Finished pretraining, best eval result in epoch {best_epoch}")
            }
            TrainStage::Finetune => {
                info!(best_epoch, "Finished training, best eval result in epoch {best_epoch}")
            }
        }
    }
}

/// One captured observer call.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    EpochStart { stage: TrainStage, epoch: usize },
    TrainPass { epoch: usize, role: OptimizerRole },
    EpochEnd { stage: TrainStage, epoch: usize, loss: Loss },
    EvalStart { epoch: usize },
    EvalEnd { epoch: usize, score: f64 },
    CheckpointSaved { epoch: i64, path: PathBuf },
    StageTransition { from: TrainStage, to: TrainStage },
    ModelMismatch { checkpoint_model: String, configured_model: String },
    TrainingStopped { stage: TrainStage, best_epoch: usize },
}

/// Captures events into a shared list; clone the handle from [`RecordingObserver::events`]
/// before boxing the observer.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObserverEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ObserverEvent>>> {
        Arc::clone(&self.events)
    }

    fn push(&self, event: ObserverEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(_) => warn!("observer event log poisoned, dropping event"),
        }
    }
}

impl TrainingObserver for RecordingObserver {
    fn on_epoch_start(&mut self, stage: TrainStage, epoch: usize) {
        self.push(ObserverEvent::EpochStart { stage, epoch });
    }

    fn on_train_pass(&mut self, epoch: usize, role: OptimizerRole) {
        self.push(ObserverEvent::TrainPass { epoch, role });
    }

    fn on_epoch_end(&mut self, stage: TrainStage, epoch: usize, loss: &Loss, _elapsed: Duration) {
        self.push(ObserverEvent::EpochEnd {
            stage,
            epoch,
            loss: loss.clone(),
        });
    }

    fn on_eval_start(&mut self, epoch: usize) {
        self.push(ObserverEvent::EvalStart { epoch });
    }

    fn on_eval_end(&mut self, epoch: usize, score: f64, _result: &EvaluationResult, _elapsed: Duration) {
        self.push(ObserverEvent::EvalEnd { epoch, score });
    }

    fn on_checkpoint_saved(&mut self, epoch: i64, path: &Path) {
        self.push(ObserverEvent::CheckpointSaved {
            epoch,
            path: path.to_path_buf(),
        });
    }

    fn on_stage_transition(&mut self, from: TrainStage, to: TrainStage) {
        self.push(ObserverEvent::StageTransition { from, to });
    }

    fn on_model_mismatch(&mut self, checkpoint_model: &str, configured_model: &str) {
        self.push(ObserverEvent::ModelMismatch {
            checkpoint_model: checkpoint_model.to_string(),
            configured_model: configured_model.to_string(),
        });
    }

    fn on_training_stopped(&mut self, stage: TrainStage, best_epoch: usize) {
        self.push(ObserverEvent::TrainingStopped { stage, best_epoch });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_shares_events() {
        let observer = RecordingObserver::new();
        let events = observer.events();
        let mut boxed: Box<dyn TrainingObserver> = Box::new(observer);
        boxed.on_epoch_start(TrainStage::Finetune, 0);
        boxed.on_checkpoint_saved(-1, Path::new("saved/x.json"));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            ObserverEvent::CheckpointSaved {
                epoch: -1,
                path: PathBuf::from("saved/x.json")
            }
        );
    }

    #[test]
    fn test_noop_and_tracing_accept_events() {
        let mut observers: Vec<Box<dyn TrainingObserver>> =
            vec![Box::new(NoopObserver), Box::new(TracingObserver::default())];
        for o in &mut observers {
            o.on_epoch_end(TrainStage::Pretrain, 1, &Loss::Scalar(0.5), Duration::from_millis(10));
            o.on_training_stopped(TrainStage::Finetune, 3);
        }
    }
}
