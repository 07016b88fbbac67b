//! Evaluation passes: full-ranking and sampled-negative scoring, single,
//! per-subset and pooled.

use crate::attributes::{SensitiveAttributeSet, subset_label};
use crate::config::{EvalType, TrainerConfig};
use crate::data::{DatasetMeta, EvalBatch, EvalDataLoader, HistoryIndex, Interaction};
use crate::error::MlError;
use crate::eval::collector::{MetricCollector, MetricEvaluator, MetricMap, Scores};
use crate::eval::split::split_predict;
use crate::model::{ModelMode, Recommender};
use ndarray::{Array1, Array2};
use tracing::debug;

/// Per-pass dataset state, rebuilt for every pass.
struct PassContext {
    dataset: DatasetMeta,
    item_tensor: Option<Interaction>,
}

impl PassContext {
    fn new(dataset: &DatasetMeta) -> Self {
        Self {
            dataset: dataset.clone(),
            item_tensor: None,
        }
    }

    fn item_num(&self) -> usize {
        self.dataset.item_num
    }

    fn item_tensor(&mut self, item_id_field: &str) -> Result<&Interaction, MlError> {
        if self.item_tensor.is_none() {
            self.item_tensor = Some(self.dataset.item_tensor(item_id_field)?);
        }
        self.item_tensor
            .as_ref()
            .ok_or_else(|| MlError::evaluation("item tensor unavailable"))
    }
}

/// Runs a model over evaluation data and aggregates metrics.
pub struct EvaluationEngine {
    eval_batch_size: usize,
    eval_type: EvalType,
    item_id_field: String,
    collector: Box<dyn MetricCollector>,
    evaluator: Box<dyn MetricEvaluator>,
}

impl EvaluationEngine {
    pub fn new(
        config: &TrainerConfig,
        collector: Box<dyn MetricCollector>,
        evaluator: Box<dyn MetricEvaluator>,
    ) -> Self {
        Self {
            eval_batch_size: config.eval_batch_size.max(1),
            eval_type: config.eval_type,
            item_id_field: config.item_id_field.clone(),
            collector,
            evaluator,
        }
    }

    pub fn collect_training_data(&mut self, dataset: &DatasetMeta) {
        self.collector.collect_training_data(dataset);
    }

    /// One pass with `revealed` attributes. An empty loader yields no metrics.
    pub fn evaluate(
        &mut self,
        model: &mut dyn Recommender,
        loader: &mut dyn EvalDataLoader,
        revealed: Option<&[String]>,
    ) -> Result<MetricMap, MlError> {
        self.run_pass(model, loader, &[revealed])
    }

    /// One full pass per non-empty attribute subset, labelled `<filter_mode>-[a, b]`.
    pub fn evaluate_subsets(
        &mut self,
        model: &mut dyn Recommender,
        loader: &mut dyn EvalDataLoader,
        attributes: &SensitiveAttributeSet,
        filter_mode: &str,
    ) -> Result<Vec<(String, MetricMap)>, MlError> {
        let mut groups = Vec::new();
        for subset in attributes.non_empty_subsets() {
            let label = format!("{filter_mode}-{}", subset_label(&subset));
            debug!(subset = %label, "evaluating attribute subset");
            let metrics = self.run_pass(model, loader, &[Some(subset.as_slice())])?;
            groups.push((label, metrics));
        }
        Ok(groups)
    }

    /// One pass that scores every batch under every subset into a single result.
    pub fn evaluate_pooled(
        &mut self,
        model: &mut dyn Recommender,
        loader: &mut dyn EvalDataLoader,
        attributes: &SensitiveAttributeSet,
    ) -> Result<MetricMap, MlError> {
        let subsets = attributes.non_empty_subsets();
        let reveals: Vec<Option<&[String]>> = subsets.iter().map(|s| Some(s.as_slice())).collect();
        self.run_pass(model, loader, &reveals)
    }

    fn run_pass(
        &mut self,
        model: &mut dyn Recommender,
        loader: &mut dyn EvalDataLoader,
        reveals: &[Option<&[String]>],
    ) -> Result<MetricMap, MlError> {
        if loader.is_empty() || reveals.is_empty() {
            return Ok(MetricMap::new());
        }
        model.set_mode(ModelMode::Eval);
        let mut ctx = PassContext::new(loader.dataset());

        for batch in loader.batches() {
            let batch = batch?;
            for &revealed in reveals {
                let scores = self.score_batch(&*model, &batch, &mut ctx, revealed)?;
                let (positive_u, positive_i) = batch.positives();
                self.collector
                    .collect_batch(&scores, batch.interaction(), positive_u, positive_i)?;
            }
        }

        self.collector.collect_model(&*model);
        let data = self.collector.finalize();
        self.evaluator.evaluate(&data)
    }

    fn score_batch(
        &self,
        model: &dyn Recommender,
        batch: &EvalBatch,
        ctx: &mut PassContext,
        revealed: Option<&[String]>,
    ) -> Result<Scores, MlError> {
        match batch {
            EvalBatch::FullSort {
                interaction,
                history,
                ..
            } => self
                .full_sort_scores(model, interaction, history.as_ref(), ctx, revealed)
                .map(Scores::Matrix),
            EvalBatch::Sampled {
                interaction,
                row_index,
                positive_u,
                ..
            } => self.sampled_scores(model, interaction, row_index, positive_u, ctx, revealed),
        }
    }

    /// Users x catalog scores with padding and history cells at `-inf`.
    fn full_sort_scores(
        &self,
        model: &dyn Recommender,
        interaction: &Interaction,
        history: Option<&HistoryIndex>,
        ctx: &mut PassContext,
        revealed: Option<&[String]>,
    ) -> Result<Array2<f32>, MlError> {
        let item_num = ctx.item_num();
        if item_num == 0 {
            return Err(MlError::evaluation("full ranking needs a non-empty catalog"));
        }

        let flat: Vec<f32> = match model.full_sort_predict(interaction, revealed)? {
            Some(scores) => scores.iter().copied().collect(),
            None => {
                let users = interaction.len();
                let mut pairs = interaction.repeat_interleave(item_num);
                pairs.update(&ctx.item_tensor(&self.item_id_field)?.repeat(users))?;
                split_predict(&pairs, self.eval_batch_size, |chunk| model.predict(chunk, revealed))?
                    .to_vec()
            }
        };

        if flat.len() % item_num != 0 {
            return Err(MlError::evaluation(format!(
                "{} scores do not divide into rows of {item_num} items",
                flat.len()
            )));
        }
        let rows = flat.len() / item_num;
        let mut scores = Array2::from_shape_vec((rows, item_num), flat)
            .map_err(|e| MlError::evaluation(format!("score matrix: {e}")))?;

        scores.column_mut(0).fill(f32::NEG_INFINITY);
        if let Some(history) = history {
            for (row, col) in history.cells() {
                if row >= rows || col >= item_num {
                    return Err(MlError::evaluation(format!(
                        "history cell ({row}, {col}) outside {rows}x{item_num} score matrix"
                    )));
                }
                scores[[row, col]] = f32::NEG_INFINITY;
            }
        }
        Ok(scores)
    }

    fn sampled_scores(
        &self,
        model: &dyn Recommender,
        interaction: &Interaction,
        row_index: &[usize],
        positive_u: &[usize],
        ctx: &PassContext,
        revealed: Option<&[String]>,
    ) -> Result<Scores, MlError> {
        let raw: Array1<f32> =
            split_predict(interaction, self.eval_batch_size, |chunk| model.predict(chunk, revealed))?;

        match self.eval_type {
            EvalType::Value => Ok(Scores::Values(raw)),
            EvalType::Ranking => {
                let item_num = ctx.item_num();
                let cols = interaction.ids(&self.item_id_field)?;
                if raw.len() != row_index.len() || cols.len() != row_index.len() {
                    return Err(MlError::evaluation(format!(
                        "sampled batch has {} scores, {} row indices and {} items",
                        raw.len(),
                        row_index.len(),
                        cols.len()
                    )));
                }
                let rows = positive_u
                    .last()
                    .or_else(|| row_index.iter().max())
                    .map_or(0, |&u| u + 1);

                let mut scores = Array2::from_elem((rows, item_num), f32::NEG_INFINITY);
                for ((&row, &col), &score) in row_index.iter().zip(cols.iter()).zip(raw.iter()) {
                    let col = usize::try_from(col)
                        .ok()
                        .filter(|&c| c < item_num && row < rows)
                        .ok_or_else(|| {
                            MlError::evaluation(format!(
                                "candidate ({row}, {col}) outside {rows}x{item_num} score matrix"
                            ))
                        })?;
                    scores[[row, col]] = score;
                }
                Ok(Scores::Matrix(scores))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Column, HistoryIndex};
    use crate::testing::{InMemoryEvalLoader, RecordingCollector, ScriptedEvaluator, ScriptedModel};
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn engine(eval_type: EvalType, collector: RecordingCollector) -> EvaluationEngine {
        let config = TrainerConfig {
            eval_type,
            eval_batch_size: 3,
            ..Default::default()
        };
        EvaluationEngine::new(
            &config,
            Box::new(collector),
            Box::new(ScriptedEvaluator::new(vec![0.5])),
        )
    }

    fn users(ids: Vec<i64>) -> Interaction {
        Interaction::new()
            .with_column("user_id", Column::Ids(ndarray::Array1::from_vec(ids)))
            .unwrap()
    }

    #[test]
    fn test_full_sort_fallback_masks_padding_and_history() {
        let collector = RecordingCollector::new();
        let log = collector.log();
        let mut engine = engine(EvalType::Ranking, collector);
        let mut model = ScriptedModel::new(&[]);

        let batch = EvalBatch::FullSort {
            interaction: users(vec![1, 2]),
            history: Some(HistoryIndex::new(vec![0, 1], vec![2, 3]).unwrap()),
            positive_u: vec![0, 1],
            positive_i: vec![1, 1],
        };
        let mut loader = InMemoryEvalLoader::new(DatasetMeta::new("toy", 5), vec![batch]);
        engine.evaluate(&mut model, &mut loader, None).unwrap();

        let matrices = log.borrow().matrices.clone();
        assert_eq!(matrices.len(), 1);
        let m = &matrices[0];
        assert_eq!(m.dim(), (2, 5));
        assert_eq!(m[[0, 0]], f32::NEG_INFINITY);
        assert_eq!(m[[0, 2]], f32::NEG_INFINITY);
        assert_eq!(m[[1, 3]], f32::NEG_INFINITY);
        assert!(m[[0, 1]].is_finite());
        assert!(m[[1, 4]].is_finite());
    }

    #[test]
    fn test_full_sort_uses_model_scores_when_supported() {
        let collector = RecordingCollector::new();
        let log = collector.log();
        let mut engine = engine(EvalType::Ranking, collector);
        let mut model = ScriptedModel::new(&[]).with_full_sort(4);

        let batch = EvalBatch::FullSort {
            interaction: users(vec![1]),
            history: None,
            positive_u: vec![0],
            positive_i: vec![1],
        };
        let mut loader = InMemoryEvalLoader::new(DatasetMeta::new("toy", 4), vec![batch]);
        engine.evaluate(&mut model, &mut loader, None).unwrap();

        assert_eq!(model.calls().full_sort, 1);
        assert_eq!(model.calls().predict, 0);
        assert_eq!(log.borrow().matrices[0].dim(), (1, 4));
    }

    #[test]
    fn test_sampled_ranking_scatters_scores() {
        let collector = RecordingCollector::new();
        let log = collector.log();
        let mut engine = engine(EvalType::Ranking, collector);
        let mut model = ScriptedModel::new(&[]);

        let interaction = users(vec![1, 1, 2, 2])
            .with_column("item_id", Column::Ids(array![1, 3, 2, 3]))
            .unwrap();
        let batch = EvalBatch::Sampled {
            interaction,
            row_index: vec![0, 0, 1, 1],
            positive_u: vec![0, 1],
            positive_i: vec![1, 2],
        };
        let mut loader = InMemoryEvalLoader::new(DatasetMeta::new("toy", 5), vec![batch]);
        engine.evaluate(&mut model, &mut loader, None).unwrap();

        let m = log.borrow().matrices[0].clone();
        assert_eq!(m.dim(), (2, 5));
        let finite: usize = m.iter().filter(|v| v.is_finite()).count();
        assert_eq!(finite, 4);
        assert!(m[[0, 1]].is_finite());
        assert_eq!(m[[0, 2]], f32::NEG_INFINITY);
        // 4 rows with eval_batch_size 3 needs two predict calls.
        assert_eq!(model.calls().predict, 2);
    }

    #[test]
    fn test_sampled_value_returns_raw_scores() {
        let collector = RecordingCollector::new();
        let log = collector.log();
        let mut engine = engine(EvalType::Value, collector);
        let mut model = ScriptedModel::new(&[]);

        let interaction = users(vec![1, 2])
            .with_column("item_id", Column::Ids(array![1, 3]))
            .unwrap();
        let batch = EvalBatch::Sampled {
            interaction,
            row_index: vec![0, 1],
            positive_u: vec![0, 1],
            positive_i: vec![1, 3],
        };
        let mut loader = InMemoryEvalLoader::new(DatasetMeta::new("toy", 5), vec![batch]);
        engine.evaluate(&mut model, &mut loader, None).unwrap();

        let log = log.borrow();
        assert!(log.matrices.is_empty());
        assert_eq!(log.values[0].len(), 2);
    }

    #[test]
    fn test_empty_loader_is_noop() {
        let collector = RecordingCollector::new();
        let log = collector.log();
        let mut engine = engine(EvalType::Ranking, collector);
        let mut model = ScriptedModel::new(&[]);
        let mut loader = InMemoryEvalLoader::new(DatasetMeta::new("toy", 5), Vec::new());

        let metrics = engine.evaluate(&mut model, &mut loader, None).unwrap();
        assert!(metrics.is_empty());
        assert_eq!(log.borrow().finalized, 0);
    }

    #[test]
    fn test_subsets_get_fresh_passes() {
        let collector = RecordingCollector::new();
        let log = collector.log();
        let mut engine = engine(EvalType::Ranking, collector);
        let mut model = ScriptedModel::new(&["gender", "age"]).with_full_sort(4);
        let batch = EvalBatch::FullSort {
            interaction: users(vec![1]),
            history: None,
            positive_u: vec![0],
            positive_i: vec![1],
        };
        let mut loader = InMemoryEvalLoader::new(DatasetMeta::new("toy", 4), vec![batch]);
        let attrs = SensitiveAttributeSet::new(["gender", "age"]);

        let groups = engine
            .evaluate_subsets(&mut model, &mut loader, &attrs, "SM")
            .unwrap();
        let labels: Vec<&str> = groups.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["SM-['gender']", "SM-['age']", "SM-['gender', 'age']"]);
        assert_eq!(log.borrow().finalized, 3);

        let pooled = engine.evaluate_pooled(&mut model, &mut loader, &attrs).unwrap();
        assert!(!pooled.is_empty());
        assert_eq!(log.borrow().finalized, 4);
        assert_eq!(log.borrow().batches_in_last_pass, 3);
    }
}
