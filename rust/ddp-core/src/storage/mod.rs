// rust/ddp-core/src/storage/mod.rs

//! Storage for checkpoints, the results artifact and per-rank logs.
//!
//! Everything the coordination core persists goes through
//! [`StorageBackend`], so the atomic checkpoint rename and the append-only
//! sinks are written once and can be tested against a temporary directory.
//!
//! # Example
//!
//! ```no_run
//! use ddp_core::storage::{LocalStorage, StorageBackend};
//! use std::io::{Read, Write};
//! use std::path::Path;
//!
//! # fn main() -> ddp_core::Result<()> {
//! let storage = LocalStorage::new("/shared/run")?;
//!
//! let mut writer = storage.open_append(Path::new("results.txt"))?;
//! writer.write_all(b"Epoch: 0, Loss: 0.6931, Accuracy: 50.00%\n").unwrap();
//! writer.finish()?;
//!
//! let mut content = String::new();
//! storage
//!     .open_read(Path::new("results.txt"))?
//!     .read_to_string(&mut content)
//!     .unwrap();
//! # Ok(())
//! # }
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{StorageBackend, StorageReader, StorageWriter};
