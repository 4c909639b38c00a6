// rust/ddp-core/src/checkpoint/writer.rs

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::CheckpointConfig;
use crate::error::{Result, RuntimeError};
use crate::storage::StorageBackend;

use super::format::{self, Compression};
use super::record::Checkpoint;

/// Persists one artifact per epoch.
///
/// Artifacts are never overwritten and never pruned, so every completed
/// epoch stays resumable.
pub struct CheckpointWriter {
    storage: Arc<dyn StorageBackend>,
    config: CheckpointConfig,
}

impl CheckpointWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: CheckpointConfig) -> Self {
        Self { storage, config }
    }

    /// Writes `checkpoint` for `job_id` and returns the artifact path.
    ///
    /// # Errors
    ///
    /// `CheckpointIo` if an artifact for this epoch already exists or if any
    /// step of encoding or writing fails.
    pub fn write(
        &self,
        job_id: &str,
        checkpoint: &Checkpoint,
        metadata: HashMap<String, String>,
    ) -> Result<PathBuf> {
        let compression =
            Compression::from_config(&self.config.compression, self.config.compression_level)?;

        let file_name = format::artifact_name(job_id, checkpoint.epoch);
        let final_path = self.config.checkpoint_dir.join(&file_name);

        if self.storage.exists(&final_path)? {
            return Err(RuntimeError::checkpoint_io(format!(
                "refusing to overwrite existing checkpoint {}",
                final_path.display()
            )));
        }

        self.storage
            .create_dir_all(&self.config.checkpoint_dir)
            .map_err(|e| {
                RuntimeError::checkpoint_io_with_source("failed to create checkpoint directory", e)
            })?;

        let payload = checkpoint.encode()?;
        let bytes = format::seal(&payload, compression, job_id, checkpoint.epoch, metadata)?;

        if self.config.atomic_writes {
            let temp_path = self.config.checkpoint_dir.join(format!(".{file_name}.tmp"));
            if let Err(e) = self.write_to_path(&temp_path, &bytes) {
                if let Err(cleanup) = self.storage.delete(&temp_path) {
                    debug!(error = %cleanup, "failed to remove partial checkpoint");
                }
                return Err(e);
            }
            self.storage.rename(&temp_path, &final_path).map_err(|e| {
                RuntimeError::checkpoint_io_with_source("failed to publish checkpoint", e)
            })?;
        } else {
            self.write_to_path(&final_path, &bytes)?;
        }

        info!(
            path = %final_path.display(),
            epoch = checkpoint.epoch,
            bytes = bytes.len(),
            compression = %compression,
            "checkpoint written"
        );
        Ok(final_path)
    }

    fn write_to_path(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut writer = self
            .storage
            .open_write(path)
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to open checkpoint file", e))?;
        writer.write_all(data).map_err(|e| {
            RuntimeError::checkpoint_io_with_source("failed to write checkpoint data", e)
        })?;
        writer
            .finish()
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to sync checkpoint", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn sample(epoch: u64) -> Checkpoint {
        Checkpoint {
            epoch,
            model_state: vec![1, 2, 3, epoch as u8],
            optimizer_state: vec![9; 16],
            loss: 0.25,
            device_kind: "cpu".to_string(),
        }
    }

    fn create_test_writer(atomic_writes: bool) -> (CheckpointWriter, Arc<dyn StorageBackend>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let config = CheckpointConfig {
            checkpoint_dir: PathBuf::from("models"),
            atomic_writes,
            ..CheckpointConfig::default()
        };
        (CheckpointWriter::new(storage.clone(), config), storage, temp_dir)
    }

    #[test]
    fn test_write_creates_named_artifact() {
        let (writer, storage, _temp) = create_test_writer(true);

        let path = writer.write("job", &sample(2), HashMap::new()).unwrap();
        assert_eq!(path, PathBuf::from("models/job_epoch_00002.ckpt"));
        assert!(storage.exists(&path).unwrap());

        // No temp file left behind
        let entries = storage.list(Path::new("models")).unwrap();
        assert_eq!(entries, vec!["job_epoch_00002.ckpt"]);
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let (writer, _storage, _temp) = create_test_writer(true);
        writer.write("job", &sample(1), HashMap::new()).unwrap();

        let err = writer.write("job", &sample(1), HashMap::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::CheckpointIo { .. }));
    }

    #[test]
    fn test_keeps_every_epoch() {
        let (writer, storage, _temp) = create_test_writer(false);
        for epoch in 0..5 {
            writer.write("job", &sample(epoch), HashMap::new()).unwrap();
        }
        assert_eq!(storage.list(Path::new("models")).unwrap().len(), 5);
    }
}
