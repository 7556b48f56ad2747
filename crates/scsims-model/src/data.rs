//! Expression matrix datasets and batch loading
//!
//! A [`MatrixDataset`] is a dense row-major `cells x genes` matrix with optional
//! integer labels and gene names. [`CollateLoader`] turns it into device tensors
//! batch by batch, optionally reordering columns onto a reference gene panel and
//! optionally collating on a background thread.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use scsims_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Dense expression matrix
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixDataset {
    data: Vec<f32>,
    n_rows: usize,
    n_cols: usize,
    labels: Option<Vec<u32>>,
    genes: Option<Vec<String>>,
}

impl MatrixDataset {
    pub fn new(n_rows: usize, n_cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != n_rows * n_cols {
            return Err(Error::data(format!(
                "Expected {} values for a {}x{} matrix, got {}",
                n_rows * n_cols,
                n_rows,
                n_cols,
                data.len()
            )));
        }
        Ok(Self {
            data,
            n_rows,
            n_cols,
            labels: None,
            genes: None,
        })
    }

    /// Build from equal-length rows
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let n_cols = rows.first().map(Vec::len).unwrap_or(0);
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_cols) {
            return Err(Error::data(format!(
                "Row {} has {} values, expected {}",
                i,
                row.len(),
                n_cols
            )));
        }
        Self::new(rows.len(), n_cols, rows.concat())
    }

    pub fn with_labels(mut self, labels: Vec<u32>) -> Result<Self> {
        if labels.len() != self.n_rows {
            return Err(Error::data(format!(
                "{} labels given for {} rows",
                labels.len(),
                self.n_rows
            )));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn with_genes(mut self, genes: Vec<String>) -> Result<Self> {
        if genes.len() != self.n_cols {
            return Err(Error::data(format!(
                "{} gene names given for {} columns",
                genes.len(),
                self.n_cols
            )));
        }
        self.genes = Some(genes);
        Ok(self)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn labels(&self) -> Option<&[u32]> {
        self.labels.as_deref()
    }

    pub fn genes(&self) -> Option<&[String]> {
        self.genes.as_deref()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    /// Copy of the given rows, in the given order
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.n_rows) {
            return Err(Error::data(format!(
                "Row {} is out of range for {} rows",
                bad, self.n_rows
            )));
        }
        let data = rows.iter().flat_map(|&r| self.row(r)).copied().collect();
        Ok(Self {
            data,
            n_rows: rows.len(),
            n_cols: self.n_cols,
            labels: self
                .labels
                .as_ref()
                .map(|labels| rows.iter().map(|&r| labels[r]).collect()),
            genes: self.genes.clone(),
        })
    }

    /// Split off the trailing `fraction` of a shuffled row order
    pub fn split(&self, fraction: f64, seed: u64) -> Result<(Self, Self)> {
        let mut order: Vec<usize> = (0..self.n_rows).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let n_second = ((self.n_rows as f64) * fraction.clamp(0.0, 1.0)).round() as usize;
        let (first, second) = order.split_at(self.n_rows - n_second);
        Ok((self.select_rows(first)?, self.select_rows(second)?))
    }
}

/// Reorders columns from the dataset's gene panel onto a reference panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneAlignment {
    pub currgenes: Vec<String>,
    pub refgenes: Vec<String>,
}

impl GeneAlignment {
    pub fn new(currgenes: Vec<String>, refgenes: Vec<String>) -> Self {
        Self {
            currgenes,
            refgenes,
        }
    }

    /// Resolve against a matrix with `n_cols` columns
    pub fn plan(&self, n_cols: usize) -> Result<AlignmentPlan> {
        if self.currgenes.len() != n_cols {
            return Err(Error::data(format!(
                "currgenes has {} entries but the data has {} columns",
                self.currgenes.len(),
                n_cols
            )));
        }
        let position: HashMap<&str, usize> = self
            .currgenes
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect();
        let sources: Vec<Option<usize>> = self
            .refgenes
            .iter()
            .map(|g| position.get(g.as_str()).copied())
            .collect();

        let matched = sources.iter().filter(|s| s.is_some()).count();
        if matched == 0 {
            return Err(Error::data(
                "No overlap between the dataset genes and the reference genes",
            ));
        }
        debug!(
            matched,
            reference = self.refgenes.len(),
            "Aligned gene panel"
        );
        Ok(AlignmentPlan { sources })
    }
}

/// Output column `j` is copied from input column `sources[j]`, or zero-filled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentPlan {
    sources: Vec<Option<usize>>,
}

impl AlignmentPlan {
    pub fn output_dim(&self) -> usize {
        self.sources.len()
    }

    pub fn apply(&self, row: &[f32], out: &mut Vec<f32>) {
        out.extend(self.sources.iter().map(|s| s.map_or(0.0, |i| row[i])));
    }
}

/// Batch loading settings
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Background collation depth; 0 collates on the calling thread
    pub num_workers: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub alignment: Option<GeneAlignment>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_workers: 0,
            shuffle: false,
            seed: 0,
            alignment: None,
        }
    }
}

impl LoaderConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn with_alignment(mut self, alignment: Option<GeneAlignment>) -> Self {
        self.alignment = alignment;
        self
    }
}

/// One batch on the target device
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(n, n_features)` f32
    pub features: Tensor,
    /// `(n,)` u32 class indices, when the dataset is labelled
    pub labels: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.features.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct HostBatch {
    features: Vec<f32>,
    rows: usize,
    labels: Option<Vec<u32>>,
}

struct Collator {
    dataset: Arc<MatrixDataset>,
    plan: Option<AlignmentPlan>,
    n_features: usize,
}

impl Collator {
    fn collate(&self, indices: &[usize]) -> HostBatch {
        let mut features = Vec::with_capacity(indices.len() * self.n_features);
        for &i in indices {
            let row = self.dataset.row(i);
            match &self.plan {
                Some(plan) => plan.apply(row, &mut features),
                None => features.extend_from_slice(row),
            }
        }
        HostBatch {
            features,
            rows: indices.len(),
            labels: self
                .dataset
                .labels()
                .map(|labels| indices.iter().map(|&i| labels[i]).collect()),
        }
    }

    fn to_device(&self, host: HostBatch, device: &Device) -> Result<Batch> {
        let features = Tensor::from_vec(host.features, (host.rows, self.n_features), device)?;
        let labels = host
            .labels
            .map(|labels| Tensor::from_vec(labels, host.rows, device))
            .transpose()?;
        Ok(Batch { features, labels })
    }
}

/// Batches a [`MatrixDataset`] onto a device
pub struct CollateLoader {
    collator: Arc<Collator>,
    config: LoaderConfig,
}

impl std::fmt::Debug for CollateLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollateLoader")
            .field("rows", &self.collator.dataset.n_rows())
            .field("n_features", &self.collator.n_features)
            .field("config", &self.config)
            .finish()
    }
}

impl CollateLoader {
    pub fn new(dataset: MatrixDataset, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::data("batch_size must be positive"));
        }
        let plan = config
            .alignment
            .as_ref()
            .map(|a| a.plan(dataset.n_cols()))
            .transpose()?;
        let n_features = plan
            .as_ref()
            .map_or(dataset.n_cols(), AlignmentPlan::output_dim);
        Ok(Self {
            collator: Arc::new(Collator {
                dataset: Arc::new(dataset),
                plan,
                n_features,
            }),
            config,
        })
    }

    /// Columns per batch after alignment
    pub fn n_features(&self) -> usize {
        self.collator.n_features
    }

    pub fn n_rows(&self) -> usize {
        self.collator.dataset.n_rows()
    }

    pub fn has_labels(&self) -> bool {
        self.collator.dataset.labels().is_some()
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        self.n_rows().div_ceil(self.config.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn batches(&self, device: &Device) -> Batches {
        self.batches_for_epoch(0, device)
    }

    /// Batches for one epoch; shuffled loaders draw a fresh order per epoch
    pub fn batches_for_epoch(&self, epoch: u64, device: &Device) -> Batches {
        let mut order: Vec<usize> = (0..self.n_rows()).collect();
        if self.config.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(
                self.config.seed.wrapping_add(epoch),
            ));
        }
        let chunks: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        let source = if self.config.num_workers == 0 {
            BatchSource::Inline(chunks.into_iter())
        } else {
            let (tx, rx) = sync_channel(self.config.num_workers);
            let collator = Arc::clone(&self.collator);
            let handle = std::thread::spawn(move || {
                for chunk in chunks {
                    if tx.send(collator.collate(&chunk)).is_err() {
                        break;
                    }
                }
            });
            BatchSource::Prefetch {
                rx,
                handle: Some(handle),
            }
        };

        Batches {
            collator: Arc::clone(&self.collator),
            device: device.clone(),
            source,
        }
    }
}

enum BatchSource {
    Inline(std::vec::IntoIter<Vec<usize>>),
    Prefetch {
        rx: Receiver<HostBatch>,
        handle: Option<JoinHandle<()>>,
    },
}

/// Iterator over one epoch of batches
pub struct Batches {
    collator: Arc<Collator>,
    device: Device,
    source: BatchSource,
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let host = match &mut self.source {
            BatchSource::Inline(chunks) => self.collator.collate(&chunks.next()?),
            BatchSource::Prefetch { rx, handle } => match rx.recv() {
                Ok(host) => host,
                Err(_) => {
                    if let Some(handle) = handle.take() {
                        if handle.join().is_err() {
                            return Some(Err(Error::internal("Batch collation thread panicked")));
                        }
                    }
                    return None;
                }
            },
        };
        Some(self.collator.to_device(host, &self.device))
    }
}
