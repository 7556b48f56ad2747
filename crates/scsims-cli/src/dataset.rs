//! JSON expression files

use anyhow::{bail, Context};
use scsims_model::{GeneAlignment, LabelEncoder, MatrixDataset};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// `{"genes": [...], "rows": [[...]], "labels": [...]}`; `genes` and `labels` are optional
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFile {
    #[serde(default)]
    pub genes: Option<Vec<String>>,
    pub rows: Vec<Vec<f32>>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

impl DataFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if file.rows.is_empty() {
            bail!("{} contains no rows", path.display());
        }
        Ok(file)
    }

    /// Matrix with labels encoded by `encoder`, when both are present
    pub fn to_dataset(&self, encoder: Option<&LabelEncoder>) -> anyhow::Result<MatrixDataset> {
        let mut dataset = MatrixDataset::from_rows(&self.rows)?;
        if let Some(genes) = &self.genes {
            dataset = dataset.with_genes(genes.clone())?;
        }
        if let (Some(labels), Some(encoder)) = (&self.labels, encoder) {
            dataset = dataset.with_labels(encoder.transform(labels)?)?;
        }
        Ok(dataset)
    }

    /// Column alignment onto the training genes, when the file names its genes
    pub fn alignment(&self, refgenes: Option<&[String]>) -> Option<GeneAlignment> {
        match (&self.genes, refgenes) {
            (Some(genes), Some(refgenes)) if genes.as_slice() != refgenes => {
                Some(GeneAlignment::new(genes.clone(), refgenes.to_vec()))
            }
            _ => None,
        }
    }
}
