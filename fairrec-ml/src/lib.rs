//! # fairrec-ml: adversarial fairness training for recommenders
//!
//! The orchestration engine that trains a recommender jointly with a
//! sensitive-attribute filter and discriminator heads, checkpoints the run,
//! and evaluates it under every subset of revealed sensitive attributes.
//!
//! ## Layout
//!
//! 1. **Capabilities**: the [`model::Recommender`], data loader and metric
//!    collector traits the engine drives but does not implement.
//! 2. **Training**: optimizer roles, masking, early stopping, checkpoints and
//!    the [`training::TrainingOrchestrator`] state machine.
//! 3. **Evaluation**: full-ranking and sampled-negative scoring, batch
//!    splitting and combinatorial subset evaluation.

// Foundation
pub mod attributes;
pub mod config;
pub mod error;
mod float_serde;

// Consumed capabilities
pub mod data;
pub mod model;

// Training
pub mod training;

// Evaluation
pub mod eval;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use attributes::{AttributeMask, SensitiveAttributeSet};
pub use config::TrainerConfig;
pub use error::MlError;
pub use eval::{EvaluationEngine, EvaluationResult};
pub use model::{Loss, Recommender, TrainStage};
pub use training::{
    Checkpoint, CheckpointStore, EarlyStoppingController, MaskSampler, OptimizerSet,
    TrainingOrchestrator,
};
