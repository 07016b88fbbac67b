//! Sensitive attributes, masks and subset enumeration.

use crate::error::MlError;
use serde::{Deserialize, Serialize};

/// Ordered attribute identifiers fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensitiveAttributeSet {
    names: Vec<String>,
}

impl SensitiveAttributeSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The attributes a mask reveals, in declaration order.
    pub fn revealed(&self, mask: &AttributeMask) -> Result<Vec<String>, MlError> {
        if mask.len() != self.len() {
            return Err(MlError::invalid_input(format!(
                "mask of length {} does not match {} sensitive attributes",
                mask.len(),
                self.len()
            )));
        }
        Ok(self
            .names
            .iter()
            .zip(mask.bits())
            .filter(|&(_, &bit)| bit)
            .map(|(name, _)| name.clone())
            .collect())
    }

    /// Every non-empty subset, by increasing size then declaration order.
    ///
    /// Yields `2^N - 1` subsets for `N` attributes, none for an empty set.
    pub fn non_empty_subsets(&self) -> Vec<Vec<String>> {
        combinations_by_size(self.len())
            .into_iter()
            .map(|indices| indices.iter().map(|&i| self.names[i].clone()).collect())
            .collect()
    }
}

/// Index combinations of `0..n` for sizes `1..=n`, each size in lexicographic order.
pub fn combinations_by_size(n: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    for size in 1..=n {
        let mut indices: Vec<usize> = (0..size).collect();
        loop {
            out.push(indices.clone());
            // Rightmost index that can still advance.
            let Some(pos) = (0..size).rev().find(|&i| indices[i] != i + n - size) else {
                break;
            };
            indices[pos] += 1;
            for j in pos + 1..size {
                indices[j] = indices[j - 1] + 1;
            }
        }
    }
    out
}

/// Label for a subset in list-literal form: `['gender', 'age']`.
///
/// Names holding a single quote are wrapped in double quotes instead.
pub fn subset_label(subset: &[String]) -> String {
    let quoted: Vec<String> = subset
        .iter()
        .map(|name| {
            if name.contains('\'') && !name.contains('"') {
                format!("\"{name}\"")
            } else {
                format!("'{}'", name.replace('\'', "\\'"))
            }
        })
        .collect();
    format!("[{}]", quoted.join(", "))
}

/// File-name fragment for a subset: `[gender_age]`.
pub fn subset_file_tag(subset: &[String]) -> String {
    format!("[{}]", subset.join("_"))
}

/// Boolean selection over a [`SensitiveAttributeSet`]; never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMask {
    bits: Vec<bool>,
}

impl AttributeMask {
    pub fn new(bits: Vec<bool>) -> Result<Self, MlError> {
        if !bits.iter().any(|&b| b) {
            return Err(MlError::invalid_input(
                "attribute mask must reveal at least one attribute",
            ));
        }
        Ok(Self { bits })
    }

    /// Mask revealing every one of `n` attributes.
    pub fn all(n: usize) -> Result<Self, MlError> {
        Self::new(vec![true; n])
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn count_revealed(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_subsets_ordered_by_size_then_declaration() {
        let set = SensitiveAttributeSet::new(["gender", "age", "occupation"]);
        let labels: Vec<String> = set
            .non_empty_subsets()
            .iter()
            .map(|s| subset_label(s))
            .collect();
        assert_eq!(
            labels,
            vec![
                "['gender']",
                "['age']",
                "['occupation']",
                "['gender', 'age']",
                "['gender', 'occupation']",
                "['age', 'occupation']",
                "['gender', 'age', 'occupation']",
            ]
        );
    }

    #[test]
    fn test_label_quotes_like_a_list_literal() {
        let names = vec!["o'neil".to_string(), "plain".to_string()];
        assert_eq!(subset_label(&names), r#"["o'neil", 'plain']"#);
        assert_eq!(subset_file_tag(&names), "[o'neil_plain]");
    }

    #[test]
    fn test_empty_set_has_no_subsets() {
        let set = SensitiveAttributeSet::default();
        assert!(set.non_empty_subsets().is_empty());
        assert!(combinations_by_size(0).is_empty());
    }

    #[test]
    fn test_mask_rejects_empty() {
        assert!(AttributeMask::new(vec![false, false]).is_err());
        assert!(AttributeMask::new(vec![]).is_err());
        let mask = AttributeMask::new(vec![false, true]).unwrap();
        assert_eq!(mask.count_revealed(), 1);
    }

    #[test]
    fn test_revealed_follows_declaration_order() {
        let set = SensitiveAttributeSet::new(["gender", "age", "occupation"]);
        let mask = AttributeMask::new(vec![true, false, true]).unwrap();
        assert_eq!(set.revealed(&mask).unwrap(), vec!["gender", "occupation"]);

        let short = AttributeMask::new(vec![true]).unwrap();
        assert!(set.revealed(&short).is_err());
    }

    #[test]
    fn test_file_tag() {
        let subset = vec!["gender".to_string(), "age".to_string()];
        assert_eq!(subset_file_tag(&subset), "[gender_age]");
    }
}
