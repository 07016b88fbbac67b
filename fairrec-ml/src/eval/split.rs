//! Chunked prediction for batches larger than the inference batch size.

use crate::data::Interaction;
use crate::error::MlError;
use ndarray::{Array1, ArrayD};

/// Predict `interaction` in contiguous chunks of at most `chunk` rows and
/// concatenate the results in order.
///
/// A 0-d result from a single-row chunk becomes one element.
pub fn split_predict<F>(interaction: &Interaction, chunk: usize, mut predict: F) -> Result<Array1<f32>, MlError>
where
    F: FnMut(&Interaction) -> Result<ArrayD<f32>, MlError>,
{
    if interaction.len() <= chunk {
        return Ok(flatten(&predict(interaction)?));
    }
    let mut out = Vec::with_capacity(interaction.len());
    for part in interaction.split(chunk)? {
        out.extend(predict(&part)?.iter().copied());
    }
    Ok(Array1::from_vec(out))
}

fn flatten(scores: &ArrayD<f32>) -> Array1<f32> {
    scores.iter().copied().collect()
}
