//! Batches and the loader interface.

pub mod interaction;
pub mod loader;

pub use interaction::{Column, Interaction};
pub use loader::{DatasetMeta, EvalBatch, EvalDataLoader, HistoryIndex, TrainDataLoader};
