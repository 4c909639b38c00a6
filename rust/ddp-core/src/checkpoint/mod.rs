// rust/ddp-core/src/checkpoint/mod.rs

//! Checkpoint persistence and resume.
//!
//! [`CheckpointWriter`] and [`CheckpointReader`] handle individual artifacts;
//! [`CheckpointCoordinator`] makes the elected rank the only writer and keeps
//! every rank informed of what happened.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use ddp_core::checkpoint::{Checkpoint, CheckpointReader, CheckpointWriter};
//! use ddp_core::config::CheckpointConfig;
//! use ddp_core::storage::{LocalStorage, StorageBackend};
//!
//! # fn main() -> ddp_core::Result<()> {
//! let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(".")?);
//! let config = CheckpointConfig::default();
//!
//! let writer = CheckpointWriter::new(storage.clone(), config.clone());
//! let checkpoint = Checkpoint {
//!     epoch: 0,
//!     model_state: vec![0; 16],
//!     optimizer_state: Vec::new(),
//!     loss: 0.69,
//!     device_kind: "cpu".to_string(),
//! };
//! let path = writer.write("job-1", &checkpoint, HashMap::new())?;
//!
//! let reader = CheckpointReader::new(storage, &config.checkpoint_dir);
//! assert_eq!(reader.read(&path)?, checkpoint);
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod format;
mod reader;
mod record;
mod results;
mod writer;

pub use coordinator::{CheckpointCoordinator, ResumePoint, ResumeTarget};
pub use format::{artifact_name, CheckpointHeader, Compression};
pub use reader::CheckpointReader;
pub use record::Checkpoint;
pub use results::ResultsLog;
pub use writer::CheckpointWriter;
