// rust/ddp-core/src/checkpoint/reader.rs

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::storage::StorageBackend;

use super::format::{self, CheckpointHeader};
use super::record::Checkpoint;

/// Locates, reads and verifies checkpoint artifacts.
pub struct CheckpointReader {
    storage: Arc<dyn StorageBackend>,
    checkpoint_dir: PathBuf,
}

impl CheckpointReader {
    pub fn new(storage: Arc<dyn StorageBackend>, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            checkpoint_dir: checkpoint_dir.into(),
        }
    }

    pub fn path_for(&self, job_id: &str, epoch: u64) -> PathBuf {
        self.checkpoint_dir.join(format::artifact_name(job_id, epoch))
    }

    /// Raw artifact bytes, unverified.
    pub fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = self
            .storage
            .open_read(path)
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to open checkpoint", e))?;
        let mut bytes = Vec::with_capacity(reader.size() as usize);
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to read checkpoint", e))?;
        Ok(bytes)
    }

    /// Reads and verifies the artifact at `path`.
    ///
    /// # Errors
    ///
    /// `CheckpointIo` if the file is unreadable, has bad magic or version,
    /// fails decompression, or its size or checksum do not match.
    pub fn read(&self, path: &Path) -> Result<Checkpoint> {
        Self::decode(&self.read_bytes(path)?)
    }

    /// Verifies and decodes artifact bytes obtained elsewhere.
    pub fn decode(bytes: &[u8]) -> Result<Checkpoint> {
        let (header, payload) = format::unseal(bytes)?;
        let checkpoint = Checkpoint::decode(&payload)?;
        if checkpoint.epoch != header.epoch {
            return Err(RuntimeError::checkpoint_io(format!(
                "header says epoch {} but record says {}",
                header.epoch, checkpoint.epoch
            )));
        }
        Ok(checkpoint)
    }

    /// Reads only the header, without decompressing the payload.
    pub fn read_header(&self, path: &Path) -> Result<CheckpointHeader> {
        let mut reader = self
            .storage
            .open_read(path)
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to open checkpoint", e))?;

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).map_err(|e| {
            RuntimeError::checkpoint_io_with_source("failed to read header length", e)
        })?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        if header_len as u64 > reader.size() {
            return Err(RuntimeError::checkpoint_io("header length exceeds file size"));
        }

        let mut bytes = Vec::with_capacity(4 + header_len);
        bytes.extend_from_slice(&len_bytes);
        bytes.resize(4 + header_len, 0);
        reader
            .read_exact(&mut bytes[4..])
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to read header", e))?;

        format::parse_header(&bytes).map(|(header, _)| header)
    }

    /// Epochs with a published artifact for `job_id`, ascending.
    pub fn epochs(&self, job_id: &str) -> Result<Vec<u64>> {
        let mut epochs: Vec<u64> = self
            .storage
            .list(&self.checkpoint_dir)
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to list checkpoints", e))?
            .iter()
            .filter_map(|name| format::parse_artifact_epoch(job_id, name))
            .collect();
        epochs.sort_unstable();
        Ok(epochs)
    }

    pub fn latest_epoch(&self, job_id: &str) -> Result<Option<u64>> {
        Ok(self.epochs(job_id)?.last().copied())
    }
}
