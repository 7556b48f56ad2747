//! String class labels to integer indices and back

use scsims_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps predicted class indices back to labels
pub trait LabelDecoder {
    fn inverse_transform(&self, indices: &[u32]) -> Result<Vec<String>>;
}

/// Sorted-unique label encoder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Learn the classes present in `labels`
    pub fn fit<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut classes: Vec<String> = labels.iter().map(|l| l.as_ref().to_string()).collect();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn transform<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<u32>> {
        labels
            .iter()
            .map(|label| {
                self.classes
                    .binary_search_by(|c| c.as_str().cmp(label.as_ref()))
                    .map(|i| i as u32)
                    .map_err(|_| Error::data(format!("Unknown label '{}'", label.as_ref())))
            })
            .collect()
    }

    /// Index to label map, as stored in model archives
    pub fn to_mapper(&self) -> BTreeMap<u32, String> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (i as u32, c.clone()))
            .collect()
    }
}

impl LabelDecoder for LabelEncoder {
    fn inverse_transform(&self, indices: &[u32]) -> Result<Vec<String>> {
        indices
            .iter()
            .map(|&i| {
                self.classes
                    .get(i as usize)
                    .cloned()
                    .ok_or_else(|| Error::data(format!("Class index {} has no label", i)))
            })
            .collect()
    }
}

impl LabelDecoder for BTreeMap<u32, String> {
    fn inverse_transform(&self, indices: &[u32]) -> Result<Vec<String>> {
        indices
            .iter()
            .map(|i| {
                self.get(i)
                    .cloned()
                    .ok_or_else(|| Error::data(format!("Class index {} has no label", i)))
            })
            .collect()
    }
}
