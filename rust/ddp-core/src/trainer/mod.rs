// rust/ddp-core/src/trainer/mod.rs

//! Synchronous data-parallel training loop.
//!
//! The model and optimizer are capabilities supplied by the caller
//! ([`TrainableModule`], [`Optimizer`]); [`reference`] has a small
//! softmax-regression workload used by the worker binary and tests.

mod metrics;
pub mod reference;
mod synchronized;
mod traits;

pub use metrics::{EpochMetrics, RunningTotals};
pub use synchronized::{SynchronizedTrainer, TrainerOptions, TrainerState, TrainingSummary};
pub use traits::{LocalStep, Optimizer, TrainableModule};
