//! Deterministic test doubles for the capabilities the engine consumes.
//!
//! Available under `cfg(test)` and the `testing` feature.

use crate::data::{Column, DatasetMeta, EvalBatch, EvalDataLoader, Interaction, TrainDataLoader};
use crate::error::MlError;
use crate::eval::{DataStruct, DataValue, MetricCollector, MetricEvaluator, MetricMap, Scores};
use crate::model::{Loss, ModelMode, Parameter, Recommender, TrainStage};
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Counters of every call a [`ScriptedModel`] received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallLog {
    pub calculate_loss: usize,
    pub discriminator_loss: usize,
    pub predict: usize,
    pub full_sort: usize,
    pub normalize_ips: usize,
    pub backward: usize,
    pub stages: Vec<TrainStage>,
    /// Revealed attributes per loss call, in call order.
    pub revealed: Vec<Option<Vec<String>>>,
}

/// A model with fixed parameters, scripted losses and arithmetic scores.
///
/// Scores are `0.1 * user + 0.01 * item + 0.001 * revealed`, so every
/// prediction is finite and distinguishable by input.
#[derive(Debug)]
pub struct ScriptedModel {
    name: String,
    params: BTreeMap<String, Parameter>,
    mode: ModelMode,
    losses: Vec<f64>,
    nan_at: Option<usize>,
    full_sort_items: Option<usize>,
    ips_rounds: u64,
    calls: RefCell<CallLog>,
}

impl ScriptedModel {
    /// Parameters for the embeddings plus a filter and discriminator per attribute.
    pub fn new(attributes: &[&str]) -> Self {
        let mut names = vec![
            "user_embedding_layer.weight".to_string(),
            "item_embedding_layer.weight".to_string(),
            "filter_layer.weight".to_string(),
        ];
        for attr in attributes {
            names.push(format!("filter_layer_dict.{attr}.weight"));
            names.push(format!("dis_layer_dict.{attr}.weight"));
        }
        let params = names
            .into_iter()
            .map(|n| (n, Parameter::new(ArrayD::from_elem(IxDyn(&[4]), 0.5))))
            .collect();
        Self {
            name: "Scripted".to_string(),
            params,
            mode: ModelMode::Train,
            losses: vec![1.0],
            nan_at: None,
            full_sort_items: None,
            ips_rounds: 0,
            calls: RefCell::new(CallLog::default()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Loss of the n-th `calculate_loss` call; the last value repeats.
    pub fn with_losses(mut self, losses: Vec<f64>) -> Self {
        self.losses = losses;
        self
    }

    /// Make the `call`-th `calculate_loss` call (zero based) return NaN.
    pub fn with_nan_at(mut self, call: usize) -> Self {
        self.nan_at = Some(call);
        self
    }

    /// Answer `full_sort_predict` over a catalog of `item_num` items.
    pub fn with_full_sort(mut self, item_num: usize) -> Self {
        self.full_sort_items = Some(item_num);
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.borrow().clone()
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn ips_rounds(&self) -> u64 {
        self.ips_rounds
    }

    /// First element of a parameter's value.
    pub fn parameter_value(&self, name: &str) -> Option<f32> {
        self.params.get(name).and_then(|p| p.value.iter().next().copied())
    }

    pub fn set_parameter_value(&mut self, name: &str, value: f32) {
        if let Some(p) = self.params.get_mut(name) {
            p.value.fill(value);
        }
    }

    fn score(user: i64, item: i64, revealed: Option<&[String]>) -> f32 {
        let revealed = revealed.map_or(0, <[String]>::len);
        0.1 * user as f32 + 0.01 * item as f32 + 0.001 * revealed as f32
    }
}

impl Recommender for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn calculate_loss(
        &mut self,
        _batch: &Interaction,
        revealed: Option<&[String]>,
    ) -> Result<Loss, MlError> {
        let mut calls = self.calls.borrow_mut();
        let index = calls.calculate_loss;
        calls.calculate_loss += 1;
        calls.revealed.push(revealed.map(<[String]>::to_vec));

        if self.nan_at == Some(index) {
            return Ok(Loss::Scalar(f64::NAN));
        }
        let value = self
            .losses
            .get(index)
            .or_else(|| self.losses.last())
            .copied()
            .unwrap_or(1.0);
        Ok(Loss::Scalar(value))
    }

    fn calculate_discriminator_loss(
        &mut self,
        _batch: &Interaction,
        revealed: Option<&[String]>,
    ) -> Result<Loss, MlError> {
        let mut calls = self.calls.borrow_mut();
        calls.discriminator_loss += 1;
        calls.revealed.push(revealed.map(<[String]>::to_vec));
        Ok(Loss::Scalar(0.5))
    }

    fn backward(&mut self, _loss: &Loss) -> Result<(), MlError> {
        self.calls.borrow_mut().backward += 1;
        for param in self.params.values_mut() {
            match &mut param.grad {
                Some(grad) => grad.mapv_inplace(|g| g + 0.1),
                None => param.grad = Some(ArrayD::from_elem(param.value.raw_dim(), 0.1)),
            }
        }
        Ok(())
    }

    fn predict(&self, batch: &Interaction, revealed: Option<&[String]>) -> Result<ArrayD<f32>, MlError> {
        self.calls.borrow_mut().predict += 1;
        let users = batch.ids("user_id")?;
        let items = batch.ids("item_id").ok();
        let scores: Array1<f32> = users
            .iter()
            .enumerate()
            .map(|(row, &u)| Self::score(u, items.map_or(0, |i| i[row]), revealed))
            .collect();
        Ok(scores.into_dyn())
    }

    fn parameters(&self) -> Vec<(&str, &Parameter)> {
        self.params.iter().map(|(n, p)| (n.as_str(), p)).collect()
    }

    fn parameters_mut(&mut self) -> Vec<(&str, &mut Parameter)> {
        self.params.iter_mut().map(|(n, p)| (n.as_str(), p)).collect()
    }

    fn set_train_stage(&mut self, stage: TrainStage) {
        self.calls.borrow_mut().stages.push(stage);
    }

    fn full_sort_predict(
        &self,
        batch: &Interaction,
        revealed: Option<&[String]>,
    ) -> Result<Option<ArrayD<f32>>, MlError> {
        let Some(item_num) = self.full_sort_items else {
            return Ok(None);
        };
        self.calls.borrow_mut().full_sort += 1;
        let users = batch.ids("user_id")?;
        let scores = Array2::from_shape_fn((users.len(), item_num), |(row, item)| {
            Self::score(users[row], item as i64, revealed)
        });
        Ok(Some(scores.into_dyn()))
    }

    fn other_parameter(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "ips_rounds": self.ips_rounds }))
    }

    fn load_other_parameter(&mut self, state: Option<&serde_json::Value>) -> Result<(), MlError> {
        if let Some(rounds) = state.and_then(|s| s.get("ips_rounds")).and_then(|v| v.as_u64()) {
            self.ips_rounds = rounds;
        }
        Ok(())
    }

    fn sensitive_embeddings(
        &self,
        user_features: &Interaction,
        revealed: Option<&[String]>,
    ) -> Result<ArrayD<f32>, MlError> {
        let fill = revealed.map_or(0, <[String]>::len) as f32;
        Ok(ArrayD::from_elem(IxDyn(&[user_features.len(), 2]), fill))
    }

    fn normalize_ips(&mut self) -> Result<(), MlError> {
        self.calls.borrow_mut().normalize_ips += 1;
        self.ips_rounds += 1;
        Ok(())
    }
}

/// `rows` interactions of consecutive users and items.
pub fn toy_batch(rows: usize) -> Interaction {
    let ids = Array1::from_iter(1..=rows as i64);
    Interaction::new()
        .with_column("user_id", Column::Ids(ids.clone()))
        .and_then(|i| i.with_column("item_id", Column::Ids(ids)))
        .unwrap_or_default()
}

/// A dataset with `item_num` items and `users` real users plus padding.
pub fn toy_dataset(item_num: usize, users: usize) -> DatasetMeta {
    let mut meta = DatasetMeta::new("toy", item_num);
    meta.user_features = Interaction::new()
        .with_column("user_id", Column::Ids(Array1::from_iter(0..=users as i64)))
        .ok();
    meta
}

/// Replays the same training batches every epoch.
#[derive(Debug, Clone)]
pub struct InMemoryTrainLoader {
    dataset: DatasetMeta,
    batches: Vec<Interaction>,
}

impl InMemoryTrainLoader {
    pub fn new(dataset: DatasetMeta, batches: Vec<Interaction>) -> Self {
        Self { dataset, batches }
    }

    /// `count` batches of `rows` rows each.
    pub fn uniform(dataset: DatasetMeta, count: usize, rows: usize) -> Self {
        Self::new(dataset, (0..count).map(|_| toy_batch(rows)).collect())
    }
}

impl TrainDataLoader for InMemoryTrainLoader {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn dataset(&self) -> &DatasetMeta {
        &self.dataset
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Interaction, MlError>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}

/// Replays fixed evaluation batches on every pass.
#[derive(Debug, Clone)]
pub struct InMemoryEvalLoader {
    dataset: DatasetMeta,
    batches: Vec<EvalBatch>,
}

impl InMemoryEvalLoader {
    pub fn new(dataset: DatasetMeta, batches: Vec<EvalBatch>) -> Self {
        Self { dataset, batches }
    }

    /// One full-ranking batch over `users` users without history.
    pub fn full_sort(dataset: DatasetMeta, users: usize) -> Self {
        let ids = Array1::from_iter(1..=users as i64);
        let interaction = Interaction::new()
            .with_column("user_id", Column::Ids(ids))
            .unwrap_or_default();
        let batch = EvalBatch::FullSort {
            interaction,
            history: None,
            positive_u: (0..users).collect(),
            positive_i: vec![1; users],
        };
        Self::new(dataset, vec![batch])
    }
}

impl EvalDataLoader for InMemoryEvalLoader {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn dataset(&self) -> &DatasetMeta {
        &self.dataset
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<EvalBatch, MlError>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}

/// What a [`RecordingCollector`] saw.
#[derive(Debug, Clone, Default)]
pub struct CollectorLog {
    pub matrices: Vec<Array2<f32>>,
    pub values: Vec<Array1<f32>>,
    pub finalized: usize,
    /// `collect_batch` calls in the most recently finalized pass.
    pub batches_in_last_pass: usize,
    pub training_data: Option<String>,
    pub models: Vec<String>,
    current: usize,
}

/// Keeps every score it is handed; read it back through [`RecordingCollector::log`].
#[derive(Debug, Clone, Default)]
pub struct RecordingCollector {
    log: Rc<RefCell<CollectorLog>>,
}

impl RecordingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Rc<RefCell<CollectorLog>> {
        Rc::clone(&self.log)
    }
}

impl MetricCollector for RecordingCollector {
    fn collect_training_data(&mut self, dataset: &DatasetMeta) {
        self.log.borrow_mut().training_data = Some(dataset.name.clone());
    }

    fn collect_model(&mut self, model: &dyn Recommender) {
        self.log.borrow_mut().models.push(model.name().to_string());
    }

    fn collect_batch(
        &mut self,
        scores: &Scores,
        _interaction: &Interaction,
        _positive_u: &[usize],
        _positive_i: &[usize],
    ) -> Result<(), MlError> {
        let mut log = self.log.borrow_mut();
        match scores {
            Scores::Matrix(m) => log.matrices.push(m.clone()),
            Scores::Values(v) => log.values.push(v.clone()),
        }
        log.current += 1;
        Ok(())
    }

    fn finalize(&mut self) -> DataStruct {
        let mut log = self.log.borrow_mut();
        let batches = log.current;
        log.current = 0;
        log.batches_in_last_pass = batches;
        log.finalized += 1;
        DataStruct::from([("batches".to_string(), DataValue::Scalar(batches as f64))])
    }
}

/// Reports `mrr@10` from a script, one value per call; the last value repeats.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    scores: Vec<f64>,
    cursor: Cell<usize>,
}

impl ScriptedEvaluator {
    pub fn new(scores: Vec<f64>) -> Self {
        Self {
            scores,
            cursor: Cell::new(0),
        }
    }
}

impl MetricEvaluator for ScriptedEvaluator {
    fn evaluate(&self, _data: &DataStruct) -> Result<MetricMap, MlError> {
        let index = self.cursor.get();
        self.cursor.set(index + 1);
        let score = self
            .scores
            .get(index)
            .or_else(|| self.scores.last())
            .copied()
            .unwrap_or(0.0);
        Ok(MetricMap::from([("mrr@10".to_string(), score)]))
    }
}
