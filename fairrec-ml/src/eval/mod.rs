//! Evaluation: scoring strategies and metric collection.

pub mod collector;
pub mod engine;
pub mod split;

pub use collector::{
    DataStruct, DataValue, EvaluationResult, MetricCollector, MetricEvaluator, MetricMap, Scores,
    calculate_valid_score, prefixed,
};
pub use engine::EvaluationEngine;
pub use split::split_predict;
