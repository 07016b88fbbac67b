//! Training: optimizer roles, attribute masking, early stopping, checkpoints
//! and the orchestrator that drives them.

pub mod checkpoint;
pub mod clip;
pub mod early_stopping;
pub mod embeddings;
pub mod mask;
pub mod observer;
pub mod optim;
pub mod orchestrator;
pub mod plan;
pub mod session;

pub use checkpoint::{CHECKPOINT_FORMAT_VERSION, Checkpoint, CheckpointStore};
pub use clip::clip_grad_norm;
pub use early_stopping::{
    EarlyStoppingController, EarlyStoppingDecision, ScoreDirection, early_stopping,
};
pub use embeddings::{EmbeddingExport, export_embeddings};
pub use mask::MaskSampler;
pub use observer::{
    NoopObserver, ObserverEvent, RecordingObserver, TracingObserver, TrainingObserver,
};
pub use optim::{LearnerKind, Optimizer, OptimizerRole, OptimizerSet, OptimizerSnapshot};
pub use orchestrator::{EvaluateOptions, FitOptions, FitOutcome, TrainingOrchestrator};
pub use plan::{LossKind, ModelKind, TrainingPlan, TrainingVariant};
pub use session::TrainingSession;
