// rust/ddp-core/src/checkpoint/results.rs

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::error::{Result, RuntimeError};
use crate::storage::StorageBackend;
use crate::trainer::EpochMetrics;

/// Append-only per-epoch summary kept by the elected rank.
///
/// One file per run, named after the run's start time. Each line is
/// `Epoch: {e}, Loss: {l:.4}, Accuracy: {a:.2}%`.
pub struct ResultsLog {
    storage: Arc<dyn StorageBackend>,
    path: PathBuf,
}

impl ResultsLog {
    pub fn new(storage: Arc<dyn StorageBackend>, results_dir: &Path) -> Self {
        Self::started_at(storage, results_dir, Local::now())
    }

    pub fn started_at(
        storage: Arc<dyn StorageBackend>,
        results_dir: &Path,
        started: DateTime<Local>,
    ) -> Self {
        let file_name = format!(
            "distributed_training_results_{}.txt",
            started.format("%Y%m%d_%H%M%S")
        );
        Self {
            storage,
            path: results_dir.join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format_line(metrics: &EpochMetrics) -> String {
        format!(
            "Epoch: {}, Loss: {:.4}, Accuracy: {:.2}%\n",
            metrics.epoch, metrics.mean_loss, metrics.accuracy_pct
        )
    }

    pub fn append(&self, metrics: &EpochMetrics) -> Result<()> {
        let line = Self::format_line(metrics);
        let mut writer = self
            .storage
            .open_append(&self.path)
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to open results file", e))?;
        writer
            .write_all(line.as_bytes())
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to append results", e))?;
        writer
            .finish()
            .map_err(|e| RuntimeError::checkpoint_io_with_source("failed to sync results", e))
    }
}
