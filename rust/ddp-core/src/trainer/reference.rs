// rust/ddp-core/src/trainer/reference.rs

//! Reference workload: softmax regression trained with Adam.
//!
//! Small enough to run on every rank of a smoke test, and fully
//! deterministic given its seed.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::Batch;
use crate::error::{Result, RuntimeError};

use super::traits::{LocalStep, Optimizer, TrainableModule};

/// Multinomial logistic regression over flat features.
///
/// Parameters are laid out as the `num_classes x feature_dim` weight matrix
/// (row-major) followed by `num_classes` biases.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    feature_dim: usize,
    num_classes: usize,
    params: Vec<f32>,
    grads: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct LinearState {
    feature_dim: usize,
    num_classes: usize,
    params: Vec<f32>,
}

impl LinearClassifier {
    /// Uniform init in `[-1/sqrt(d), 1/sqrt(d))`.
    pub fn new(feature_dim: usize, num_classes: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let bound = 1.0 / (feature_dim.max(1) as f32).sqrt();
        let len = num_classes * feature_dim + num_classes;
        let params = (0..len).map(|_| rng.gen_range(-bound..bound)).collect();

        Self {
            feature_dim,
            num_classes,
            params,
            grads: vec![0.0; len],
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn check_batch(&self, batch: &Batch) -> std::result::Result<(), String> {
        if batch.is_empty() {
            return Err("empty batch".to_string());
        }
        if batch.feature_dim != self.feature_dim {
            return Err(format!(
                "batch has {} features, model expects {}",
                batch.feature_dim, self.feature_dim
            ));
        }
        if batch.features.len() != batch.len() * batch.feature_dim {
            return Err(format!(
                "batch holds {} feature values for {} samples",
                batch.features.len(),
                batch.len()
            ));
        }
        if let Some(label) = batch.labels.iter().find(|&&l| l as usize >= self.num_classes) {
            return Err(format!("label {label} outside {} classes", self.num_classes));
        }
        Ok(())
    }

    fn logits(&self, x: &[f32], out: &mut [f32]) {
        let (weights, bias) = self.params.split_at(self.num_classes * self.feature_dim);
        for (c, logit) in out.iter_mut().enumerate() {
            let row = &weights[c * self.feature_dim..(c + 1) * self.feature_dim];
            *logit = bias[c] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>();
        }
    }
}

// The trainer attributes these to its own rank.
fn compute_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::local_compute(usize::MAX, message)
}

fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best as u32
}

/// Numerically stable softmax in place.
fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

impl TrainableModule for LinearClassifier {
    fn forward(&self, batch: &Batch) -> Result<Vec<u32>> {
        self.check_batch(batch).map_err(compute_error)?;

        let mut logits = vec![0.0; self.num_classes];
        Ok((0..batch.len())
            .map(|i| {
                self.logits(batch.row(i), &mut logits);
                argmax(&logits)
            })
            .collect())
    }

    fn compute_gradients(&mut self, batch: &Batch) -> Result<LocalStep> {
        self.check_batch(batch).map_err(compute_error)?;

        let n = batch.len();
        let scale = 1.0 / n as f32;
        let weights_len = self.num_classes * self.feature_dim;
        let mut grads = vec![0.0f32; self.params.len()];
        let mut probs = vec![0.0f32; self.num_classes];
        let mut loss = 0.0f64;
        let mut correct = 0u64;

        for i in 0..n {
            let x = batch.row(i);
            let label = batch.labels[i] as usize;

            self.logits(x, &mut probs);
            if argmax(&probs) as usize == label {
                correct += 1;
            }
            softmax(&mut probs);
            loss -= f64::from(probs[label].max(f32::MIN_POSITIVE).ln());

            // dL/dlogit_c = p_c - 1{c == label}
            for (c, p) in probs.iter().enumerate() {
                let delta = (p - if c == label { 1.0 } else { 0.0 }) * scale;
                let row = &mut grads[c * self.feature_dim..(c + 1) * self.feature_dim];
                for (g, v) in row.iter_mut().zip(x) {
                    *g += delta * v;
                }
                grads[weights_len + c] += delta;
            }
        }

        if !loss.is_finite() {
            return Err(compute_error("loss is not finite"));
        }
        self.grads = grads;

        Ok(LocalStep {
            loss: loss / n as f64,
            correct,
            samples: n as u64,
        })
    }

    fn parameters(&self) -> &[f32] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn gradients_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    fn split_mut(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grads)
    }

    fn state_dict(&self) -> Result<Vec<u8>> {
        bincode::serialize(&LinearState {
            feature_dim: self.feature_dim,
            num_classes: self.num_classes,
            params: self.params.clone(),
        })
        .map_err(|e| RuntimeError::serialization(format!("failed to encode model state: {e}")))
    }

    fn load_state_dict(&mut self, state: &[u8]) -> Result<()> {
        let state: LinearState = bincode::deserialize(state)
            .map_err(|e| RuntimeError::serialization(format!("failed to decode model state: {e}")))?;
        if state.feature_dim != self.feature_dim
            || state.num_classes != self.num_classes
            || state.params.len() != self.params.len()
        {
            return Err(RuntimeError::serialization(format!(
                "model state is {}x{}, expected {}x{}",
                state.num_classes, state.feature_dim, self.num_classes, self.feature_dim
            )));
        }
        self.params = state.params;
        self.grads.fill(0.0);
        Ok(())
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: AdamState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct AdamState {
    step: u64,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate: learning_rate as f32,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            state: AdamState::default(),
        }
    }

    /// Completed update steps.
    pub fn steps(&self) -> u64 {
        self.state.step
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &mut [f32], gradients: &[f32]) -> Result<()> {
        if parameters.len() != gradients.len() {
            return Err(compute_error(format!(
                "{} parameters but {} gradients",
                parameters.len(),
                gradients.len()
            )));
        }
        if self.state.m.len() != parameters.len() {
            self.state.m = vec![0.0; parameters.len()];
            self.state.v = vec![0.0; parameters.len()];
        }

        self.state.step += 1;
        let t = self.state.step.min(i32::MAX as u64) as i32;
        let correction1 = (1.0 - f64::from(self.beta1).powi(t)) as f32;
        let correction2 = (1.0 - f64::from(self.beta2).powi(t)) as f32;
        let (b1, b2) = (self.beta1, self.beta2);

        for (((p, g), m), v) in parameters
            .iter_mut()
            .zip(gradients)
            .zip(self.state.m.iter_mut())
            .zip(self.state.v.iter_mut())
        {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
        Ok(())
    }

    fn state_dict(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.state)
            .map_err(|e| RuntimeError::serialization(format!("failed to encode optimizer state: {e}")))
    }

    fn load_state_dict(&mut self, state: &[u8]) -> Result<()> {
        self.state = bincode::deserialize(state).map_err(|e| {
            RuntimeError::serialization(format!("failed to decode optimizer state: {e}"))
        })?;
        Ok(())
    }
}
