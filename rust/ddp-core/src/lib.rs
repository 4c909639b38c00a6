// rust/ddp-core/src/lib.rs

//! Data-Parallel Training - Coordination Core
//!
//! Everything a rank needs to take part in a synchronous data-parallel run:
//! resolving its place in the job, joining the process group, computing its
//! shard of each epoch, keeping model replicas in lockstep, and checkpointing
//! from a single elected rank.

pub mod config;
pub mod error;
pub mod logging;
pub mod storage;
pub mod topology;

// Re-export commonly used types for convenience
pub use config::TrainingConfig;
pub use error::{Result, RuntimeError};
pub use logging::RankLogger;
pub use storage::{LocalStorage, StorageBackend};
pub use topology::{Device, PlacementMetadata, Topology};

pub mod collective;
pub use collective::{Backend, LocalCluster, ProcessGroup, ReduceOp};

pub mod dataset;
pub use dataset::{shard_for, Dataset, SyntheticDataset};

pub mod checkpoint;
pub use checkpoint::{CheckpointCoordinator, ResumeTarget};

pub mod trainer;
pub use trainer::{EpochMetrics, SynchronizedTrainer, TrainerOptions, TrainingSummary};
