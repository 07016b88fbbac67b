//! Sensitive-embedding export after training.

use crate::attributes::subset_file_tag;
use crate::data::Interaction;
use crate::error::MlError;
use crate::model::Recommender;
use fairrec_core::persistence::atomic_write_json_compact;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// What an exported embedding file holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingExport {
    pub model: String,
    /// Attributes revealed when the embeddings were extracted; `None` for the model default.
    pub attributes: Option<Vec<String>>,
    pub embeddings: ArrayD<f32>,
}

/// `<model>-<aggr_method>_embed-[a_b].json`
pub fn staged_file_name(model: &str, aggr_method: &str, attributes: &[String]) -> String {
    format!("{model}-{aggr_method}_embed-{}.json", subset_file_tag(attributes))
}

/// `<model>-<dataset>-pretrain_embed[none].json`
pub fn pretrain_file_name(model: &str, dataset: &str) -> String {
    format!("{model}-{dataset}-pretrain_embed[none].json")
}

/// `<model>_embed-<filter_mode>-[a_b].json`
pub fn masked_file_name(model: &str, filter_mode: &str, subset: &[String]) -> String {
    format!("{model}_embed-{filter_mode}-{}.json", subset_file_tag(subset))
}

/// `<model>_embed-<filter_mode>.json`
pub fn unfiltered_file_name(model: &str, filter_mode: &str) -> String {
    format!("{model}_embed-{filter_mode}.json")
}

/// `<model>_embed.json`
pub fn plain_file_name(model: &str) -> String {
    format!("{model}_embed.json")
}

/// Extract embeddings for `users` under `revealed` and write them to `path`.
pub fn export_embeddings(
    model: &dyn Recommender,
    users: &Interaction,
    revealed: Option<&[String]>,
    path: &Path,
) -> Result<(), MlError> {
    let embeddings = model.sensitive_embeddings(users, revealed)?;
    let export = EmbeddingExport {
        model: model.name().to_string(),
        attributes: revealed.map(<[String]>::to_vec),
        embeddings,
    };
    atomic_write_json_compact(path, &export)?;
    info!(path = %path.display(), users = users.len(), "saved sensitive embeddings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> Vec<String> {
        vec!["gender".into(), "age".into()]
    }

    #[test]
    fn test_file_names() {
        assert_eq!(
            staged_file_name("FairGo_PMF", "SM", &attrs()),
            "FairGo_PMF-SM_embed-[gender_age].json"
        );
        assert_eq!(
            pretrain_file_name("FairGo_PMF", "ml-1m"),
            "FairGo_PMF-ml-1m-pretrain_embed[none].json"
        );
        assert_eq!(
            masked_file_name("PFCN_MLP", "CM", &attrs()[..1]),
            "PFCN_MLP_embed-CM-[gender].json"
        );
        assert_eq!(unfiltered_file_name("PFCN_MLP", "none"), "PFCN_MLP_embed-none.json");
        assert_eq!(plain_file_name("BPR"), "BPR_embed.json");
    }
}
