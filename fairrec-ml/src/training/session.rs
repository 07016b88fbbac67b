//! Mutable state of one training run.

use crate::eval::EvaluationResult;
use crate::model::{Loss, TrainStage};
use std::collections::BTreeMap;

/// Counters and best-so-far bookkeeping owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrainingSession {
    pub stage: TrainStage,
    /// Next epoch to run.
    pub epoch: usize,
    /// Validations since the last improvement.
    pub step: usize,
    pub best_score: Option<f64>,
    pub best_result: Option<EvaluationResult>,
    pub loss_history: BTreeMap<usize, Loss>,
}

impl TrainingSession {
    pub fn new(stage: TrainStage) -> Self {
        Self {
            stage,
            ..Default::default()
        }
    }

    /// Start `stage` from epoch zero, keeping nothing but the stage.
    pub fn reset(&mut self, stage: TrainStage) {
        *self = Self::new(stage);
    }

    pub fn record_loss(&mut self, epoch: usize, loss: Loss) {
        self.loss_history.insert(epoch, loss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_progress() {
        let mut session = TrainingSession::new(TrainStage::Pretrain);
        session.epoch = 4;
        session.step = 2;
        session.best_score = Some(0.3);
        session.record_loss(3, Loss::Scalar(0.2));

        session.reset(TrainStage::Finetune);
        assert_eq!(session, TrainingSession::new(TrainStage::Finetune));
        assert!(session.loss_history.is_empty());
    }
}
