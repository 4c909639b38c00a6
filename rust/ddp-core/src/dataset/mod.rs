// rust/ddp-core/src/dataset/mod.rs

//! Dataset access and per-epoch partitioning.
//!
//! Every rank holds the same [`Dataset`] and derives its own slice of each
//! epoch with [`shard_for`], which needs no communication.
//!
//! # Example
//!
//! ```
//! use ddp_core::dataset::{Dataset, EpochShard, SyntheticDataset};
//!
//! let data = SyntheticDataset::generate(100, 4, 42);
//! let shard = EpochShard::new(data.len(), 0, 1, 4, 0).unwrap();
//! assert_eq!(shard.len(), 25);
//!
//! for indices in shard.batches(8) {
//!     let batch = data.batch(indices).unwrap();
//!     assert!(batch.len() <= 8);
//! }
//! ```

mod partition;
mod synthetic;
mod traits;

pub use partition::{padded_len, samples_per_rank, shard_for, EpochShard};
pub use synthetic::SyntheticDataset;
pub use traits::{Batch, Dataset};
