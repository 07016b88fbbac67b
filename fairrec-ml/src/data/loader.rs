//! Data loader capabilities consumed by the engine.
//!
//! Loading, batching and negative sampling happen upstream; the engine only
//! iterates what a loader yields and reads the dataset metadata it reports.

use super::interaction::{Column, Interaction};
use crate::error::MlError;
use ndarray::Array1;

/// Dataset facts the engine needs for scoring and embedding export.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatasetMeta {
    pub name: String,
    /// Catalog size including the reserved padding item 0.
    pub item_num: usize,
    /// One row per item id, used to build all-item prediction batches.
    pub item_features: Option<Interaction>,
    /// One row per user id; row 0 is padding.
    pub user_features: Option<Interaction>,
}

impl DatasetMeta {
    pub fn new(name: impl Into<String>, item_num: usize) -> Self {
        Self {
            name: name.into(),
            item_num,
            ..Default::default()
        }
    }

    /// Item rows to pair with every user in all-item prediction.
    ///
    /// Falls back to a bare id column `0..item_num` when the dataset carries
    /// no item features.
    pub fn item_tensor(&self, item_id_field: &str) -> Result<Interaction, MlError> {
        match &self.item_features {
            Some(items) if items.len() == self.item_num => Ok(items.clone()),
            Some(items) => Err(MlError::invalid_input(format!(
                "item feature table has {} rows, catalog has {} items",
                items.len(),
                self.item_num
            ))),
            None => {
                let ids = Array1::from_iter(0..self.item_num as i64);
                Interaction::new().with_column(item_id_field, Column::Ids(ids))
            }
        }
    }

    /// User feature rows without the padding row.
    pub fn user_features_without_padding(&self) -> Result<Interaction, MlError> {
        let users = self
            .user_features
            .as_ref()
            .ok_or_else(|| MlError::not_found(format!("user features for dataset '{}'", self.name)))?;
        if users.is_empty() {
            return Ok(users.clone());
        }
        Ok(users.slice(1, users.len()))
    }
}

/// Positions of already-interacted (user row, item) cells in a batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryIndex {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
}

impl HistoryIndex {
    pub fn new(rows: Vec<usize>, cols: Vec<usize>) -> Result<Self, MlError> {
        if rows.len() != cols.len() {
            return Err(MlError::invalid_input(format!(
                "history index has {} rows but {} columns",
                rows.len(),
                cols.len()
            )));
        }
        Ok(Self { rows, cols })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }
}

/// One evaluation batch, shaped by the loader's strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalBatch {
    /// One row per user; every catalog item is scored.
    FullSort {
        interaction: Interaction,
        history: Option<HistoryIndex>,
        positive_u: Vec<usize>,
        positive_i: Vec<usize>,
    },
    /// One row per (user, candidate) pair; `row_index` maps each pair to its
    /// user row in the score matrix.
    Sampled {
        interaction: Interaction,
        row_index: Vec<usize>,
        positive_u: Vec<usize>,
        positive_i: Vec<usize>,
    },
}

impl EvalBatch {
    pub fn interaction(&self) -> &Interaction {
        match self {
            EvalBatch::FullSort { interaction, .. } | EvalBatch::Sampled { interaction, .. } => {
                interaction
            }
        }
    }

    pub fn positives(&self) -> (&[usize], &[usize]) {
        match self {
            EvalBatch::FullSort {
                positive_u,
                positive_i,
                ..
            }
            | EvalBatch::Sampled {
                positive_u,
                positive_i,
                ..
            } => (positive_u, positive_i),
        }
    }
}

/// Training batches for one epoch.
pub trait TrainDataLoader {
    /// Number of batches per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dataset(&self) -> &DatasetMeta;

    /// A fresh pass over every batch.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Interaction, MlError>> + '_>;
}

/// Evaluation batches for one pass.
pub trait EvalDataLoader {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dataset(&self) -> &DatasetMeta;

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<EvalBatch, MlError>> + '_>;
}
