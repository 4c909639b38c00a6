// rust/ddp-core/src/trainer/traits.rs

use crate::dataset::Batch;
use crate::error::Result;

/// Outcome of one local forward/backward pass.
///
/// The gradient itself is left in the module's gradient buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalStep {
    /// Mean loss over the batch
    pub loss: f64,
    /// Correct predictions in the batch
    pub correct: u64,
    pub samples: u64,
}

/// A model whose parameters and gradients are flat `f32` buffers.
pub trait TrainableModule: Send {
    /// Predicted class per sample.
    fn forward(&self, batch: &Batch) -> Result<Vec<u32>>;

    /// Computes the batch loss and writes its gradient into `gradients_mut`.
    fn compute_gradients(&mut self, batch: &Batch) -> Result<LocalStep>;

    fn parameters(&self) -> &[f32];

    fn parameters_mut(&mut self) -> &mut [f32];

    fn gradients_mut(&mut self) -> &mut [f32];

    /// Parameters and gradients together, for an optimizer step.
    fn split_mut(&mut self) -> (&mut [f32], &[f32]);

    fn state_dict(&self) -> Result<Vec<u8>>;

    fn load_state_dict(&mut self, state: &[u8]) -> Result<()>;
}

/// Update rule applied after gradients are synchronized.
pub trait Optimizer: Send {
    fn zero_grad(&mut self, gradients: &mut [f32]) {
        gradients.fill(0.0);
    }

    fn step(&mut self, parameters: &mut [f32], gradients: &[f32]) -> Result<()>;

    fn state_dict(&self) -> Result<Vec<u8>>;

    fn load_state_dict(&mut self, state: &[u8]) -> Result<()>;
}
