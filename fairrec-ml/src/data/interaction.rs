//! Columnar batches of user/item interactions.

use crate::error::MlError;
use ndarray::{Array1, Array2, Axis, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One named field of a batch. Rows line up across the columns of an
/// [`Interaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Integer tokens such as user or item ids.
    Ids(Array1<i64>),
    /// Dense per-row features.
    Floats(Array2<f32>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Ids(a) => a.len(),
            Column::Floats(a) => a.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous rows `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Column {
        match self {
            Column::Ids(a) => Column::Ids(a.slice(s![start..end]).to_owned()),
            Column::Floats(a) => Column::Floats(a.slice(s![start..end, ..]).to_owned()),
        }
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Column {
        match self {
            Column::Ids(a) => Column::Ids(a.select(Axis(0), indices)),
            Column::Floats(a) => Column::Floats(a.select(Axis(0), indices)),
        }
    }

    /// Each row repeated `times` times in place: `[a, b]` -> `[a, a, b, b]`.
    pub fn repeat_interleave(&self, times: usize) -> Column {
        let indices: Vec<usize> = (0..self.len())
            .flat_map(|row| std::iter::repeat_n(row, times))
            .collect();
        self.select(&indices)
    }

    /// The whole column tiled `times` times: `[a, b]` -> `[a, b, a, b]`.
    pub fn repeat(&self, times: usize) -> Column {
        let len = self.len();
        let indices: Vec<usize> = (0..times).flat_map(|_| 0..len).collect();
        self.select(&indices)
    }
}

/// A batch of interactions: named columns of equal length.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Interaction {
    columns: BTreeMap<String, Column>,
}

impl Interaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Interaction::insert`].
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self, MlError> {
        self.insert(name, column)?;
        Ok(self)
    }

    /// Add or replace a column; its length must match the existing rows.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), MlError> {
        let name = name.into();
        let others = self.columns.iter().filter(|(k, _)| **k != name).count();
        if others > 0 && column.len() != self.len() {
            return Err(MlError::invalid_input(format!(
                "column '{name}' has {} rows, batch has {}",
                column.len(),
                self.len()
            )));
        }
        self.columns.insert(name, column);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// The id column `name`, or an error if it is missing or not integral.
    pub fn ids(&self, name: &str) -> Result<&Array1<i64>, MlError> {
        match self.columns.get(name) {
            Some(Column::Ids(ids)) => Ok(ids),
            Some(Column::Floats(_)) => Err(MlError::invalid_input(format!(
                "field '{name}' holds features, not ids"
            ))),
            None => Err(MlError::not_found(format!("field '{name}' in interaction"))),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.values().next().map_or(0, Column::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slice(&self, start: usize, end: usize) -> Interaction {
        self.map_columns(|c| c.slice(start, end))
    }

    pub fn select_rows(&self, indices: &[usize]) -> Interaction {
        self.map_columns(|c| c.select(indices))
    }

    pub fn repeat_interleave(&self, times: usize) -> Interaction {
        self.map_columns(|c| c.repeat_interleave(times))
    }

    pub fn repeat(&self, times: usize) -> Interaction {
        self.map_columns(|c| c.repeat(times))
    }

    /// Merge the columns of `other`, replacing same-named ones.
    pub fn update(&mut self, other: &Interaction) -> Result<(), MlError> {
        for (name, column) in &other.columns {
            self.insert(name.clone(), column.clone())?;
        }
        Ok(())
    }

    /// Contiguous chunks of at most `chunk` rows, in order.
    pub fn split(&self, chunk: usize) -> Result<Vec<Interaction>, MlError> {
        if chunk == 0 {
            return Err(MlError::invalid_input("split chunk size must be positive"));
        }
        let len = self.len();
        Ok((0..len)
            .step_by(chunk)
            .map(|start| self.slice(start, (start + chunk).min(len)))
            .collect())
    }

    fn map_columns(&self, f: impl Fn(&Column) -> Column) -> Interaction {
        Interaction {
            columns: self
                .columns
                .iter()
                .map(|(name, column)| (name.clone(), f(column)))
                .collect(),
        }
    }
}
