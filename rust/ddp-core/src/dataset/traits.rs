// rust/ddp-core/src/dataset/traits.rs

use crate::error::Result;

/// A materialized mini-batch, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: Vec<f32>,
    pub labels: Vec<u32>,
    pub feature_dim: usize,
}

impl Batch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Feature row of sample `i`
    pub fn row(&self, i: usize) -> &[f32] {
        &self.features[i * self.feature_dim..(i + 1) * self.feature_dim]
    }
}

/// Indexable dataset shared identically by every rank.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn feature_dim(&self) -> usize;

    /// Gathers the samples at `indices` into a batch, in order.
    fn batch(&self, indices: &[usize]) -> Result<Batch>;
}
