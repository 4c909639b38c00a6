// rust/ddp-core/src/storage/traits.rs

use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;

/// Sequential read handle with a known length.
pub trait StorageReader: Read + Send {
    fn size(&self) -> u64;
}

/// Write handle; nothing is durable until [`finish`](Self::finish) returns.
pub trait StorageWriter: Write + Send {
    /// Flushes buffered bytes and syncs them to stable storage.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Where checkpoints, results and per-rank logs live.
///
/// Object-safe; components hold it as `Arc<dyn StorageBackend>`. Writers
/// create missing parent directories.
pub trait StorageBackend: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Creates or truncates `path`.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Opens `path` for appending, creating it if absent. Existing content
    /// is never truncated.
    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// File names directly under `dir`, sorted. A missing directory lists
    /// as empty.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;

    /// Replaces `to` with `from`; atomic on a single filesystem.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;
}
