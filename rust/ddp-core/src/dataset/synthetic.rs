// rust/ddp-core/src/dataset/synthetic.rs

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use super::traits::{Batch, Dataset};
use crate::error::{Result, RuntimeError};

/// Seeded binary classification data.
///
/// Features are drawn from a standard normal distribution and a sample is
/// labeled `1` when its features sum to a positive value. The same seed
/// produces the same dataset on every rank.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    features: Vec<f32>,
    labels: Vec<u32>,
    feature_dim: usize,
}

impl SyntheticDataset {
    pub fn generate(num_samples: usize, feature_dim: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut features = Vec::with_capacity(num_samples * feature_dim);
        let mut labels = Vec::with_capacity(num_samples);

        for _ in 0..num_samples {
            let mut sum = 0.0f32;
            for _ in 0..feature_dim {
                let x: f32 = StandardNormal.sample(&mut rng);
                sum += x;
                features.push(x);
            }
            labels.push(u32::from(sum > 0.0));
        }

        Self {
            features,
            labels,
            feature_dim,
        }
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

impl Dataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn batch(&self, indices: &[usize]) -> Result<Batch> {
        let mut features = Vec::with_capacity(indices.len() * self.feature_dim);
        let mut labels = Vec::with_capacity(indices.len());

        for &i in indices {
            if i >= self.labels.len() {
                return Err(RuntimeError::configuration(format!(
                    "sample index {i} out of range for dataset of {}",
                    self.labels.len()
                )));
            }
            features.extend_from_slice(&self.features[i * self.feature_dim..(i + 1) * self.feature_dim]);
            labels.push(self.labels[i]);
        }

        Ok(Batch {
            features,
            labels,
            feature_dim: self.feature_dim,
        })
    }
}
