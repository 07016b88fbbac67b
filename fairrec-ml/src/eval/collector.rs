//! Metric collection and aggregation capabilities.
//!
//! The collector accumulates per-batch scores during a pass; the evaluator
//! turns the finalized structure into named metrics. Metric formulas live
//! outside this crate.

use crate::data::{DatasetMeta, Interaction};
use crate::error::MlError;
use crate::model::Recommender;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric name to value, e.g. `recall@10 -> 0.21`.
pub type MetricMap = BTreeMap<String, f64>;

/// Metrics of one evaluation, flat or grouped by a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluationResult {
    Metrics(MetricMap),
    /// One entry per label (attribute subset or filter mode), in evaluation order.
    Grouped(Vec<(String, MetricMap)>),
}

impl EvaluationResult {
    pub fn empty() -> Self {
        Self::Metrics(MetricMap::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Metrics(m) => m.is_empty(),
            Self::Grouped(g) => g.is_empty(),
        }
    }

    /// Flat metrics, if this result is not grouped.
    pub fn metrics(&self) -> Option<&MetricMap> {
        match self {
            Self::Metrics(m) => Some(m),
            Self::Grouped(_) => None,
        }
    }

    pub fn group(&self, label: &str) -> Option<&MetricMap> {
        match self {
            Self::Metrics(_) => None,
            Self::Grouped(groups) => groups.iter().find(|(l, _)| l == label).map(|(_, m)| m),
        }
    }

    pub fn labels(&self) -> Vec<&str> {
        match self {
            Self::Metrics(_) => Vec::new(),
            Self::Grouped(groups) => groups.iter().map(|(l, _)| l.as_str()).collect(),
        }
    }

    /// Single-line rendering for logs: `recall@10 : 0.2100    ndcg@10 : 0.1500`.
    pub fn describe(&self) -> String {
        fn line(m: &MetricMap) -> String {
            m.iter()
                .map(|(k, v)| format!("{k} : {v:.4}"))
                .collect::<Vec<_>>()
                .join("    ")
        }
        match self {
            Self::Metrics(m) => line(m),
            Self::Grouped(groups) => groups
                .iter()
                .map(|(label, m)| format!("{label}: {}", line(m)))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Prefix every metric name, e.g. `pretrain-` + `recall@10`.
pub fn prefixed(prefix: &str, metrics: &MetricMap) -> MetricMap {
    metrics
        .iter()
        .map(|(k, v)| (format!("{prefix}{k}"), *v))
        .collect()
}

/// Look up the validation metric (case-insensitive).
pub fn calculate_valid_score(result: &MetricMap, valid_metric: &str) -> Result<f64, MlError> {
    let wanted = valid_metric.to_lowercase();
    result
        .iter()
        .find(|(k, _)| k.to_lowercase() == wanted)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            MlError::evaluation(format!(
                "valid metric '{valid_metric}' missing from result (have: {})",
                result.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
}

/// Scores handed to the collector for one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Scores {
    /// Users in the batch x catalog items.
    Matrix(Array2<f32>),
    /// One raw score per (user, item) row.
    Values(Array1<f32>),
}

/// One accumulated quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Matrix(Array2<f32>),
    Vector(Array1<f32>),
    Indices(Vec<usize>),
    Scalar(f64),
}

/// What a collector hands to the evaluator.
pub type DataStruct = BTreeMap<String, DataValue>;

/// Stateful accumulator fed once per evaluated batch.
pub trait MetricCollector {
    /// Record training-set statistics (e.g. item popularity).
    fn collect_training_data(&mut self, dataset: &DatasetMeta);

    /// Record model-level quantities after a pass.
    fn collect_model(&mut self, model: &dyn Recommender);

    fn collect_batch(
        &mut self,
        scores: &Scores,
        interaction: &Interaction,
        positive_u: &[usize],
        positive_i: &[usize],
    ) -> Result<(), MlError>;

    /// Hand over the accumulated pass and start a fresh one.
    fn finalize(&mut self) -> DataStruct;
}

/// Turns a finalized pass into named metrics.
pub trait MetricEvaluator {
    fn evaluate(&self, data: &DataStruct) -> Result<MetricMap, MlError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metrics() -> MetricMap {
        MetricMap::from([("mrr@10".to_string(), 0.3), ("recall@10".to_string(), 0.5)])
    }

    #[test]
    fn test_valid_score_is_case_insensitive() {
        assert_eq!(calculate_valid_score(&metrics(), "MRR@10").unwrap(), 0.3);
        assert!(matches!(
            calculate_valid_score(&metrics(), "ndcg@10"),
            Err(MlError::Evaluation(_))
        ));
    }

    #[test]
    fn test_prefixed() {
        let p = prefixed("finetune-", &metrics());
        assert_eq!(p["finetune-recall@10"], 0.5);
    }

    #[test]
    fn test_grouped_lookup() {
        let result = EvaluationResult::Grouped(vec![
            ("SM-['gender']".to_string(), metrics()),
            ("SM-['age']".to_string(), MetricMap::new()),
        ]);
        assert_eq!(result.labels(), vec!["SM-['gender']", "SM-['age']"]);
        assert_eq!(result.group("SM-['gender']").unwrap()["mrr@10"], 0.3);
        assert!(result.metrics().is_none());
    }

    #[test]
    fn test_result_json_shapes() {
        let flat = EvaluationResult::Metrics(metrics());
        let json = serde_json::to_string(&flat).unwrap();
        assert_eq!(json, r#"{"mrr@10":0.3,"recall@10":0.5}"#);
        let back: EvaluationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flat);
    }
}
