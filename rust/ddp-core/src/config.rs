// rust/ddp-core/src/config.rs

//! Configuration for a data-parallel training run.
//!
//! Configuration is parsed from TOML, then environment overrides are applied,
//! then the values are validated. Placement (rank, world size) is not part of
//! this file; it comes from the scheduler through [`crate::topology`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RuntimeError};
use crate::topology::Topology;

// Top-level training configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub rendezvous: RendezvousConfig,
    pub dataset: DatasetConfig,
    pub training: LoopConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

/// Process group rendezvous and collective settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Address rank 0 listens on and every other rank connects to.
    pub master_addr: String,
    /// Port rank 0 listens on.
    pub master_port: u16,
    /// Upper bound on how long `join` waits for the full group.
    pub join_timeout_ms: u64,
    /// Upper bound on each steady-state collective receive.
    /// `None` blocks indefinitely on a stalled peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collective_timeout_ms: Option<u64>,
    /// Delay between connection attempts while the master is not yet listening.
    pub connect_retry_ms: u64,
}

// Shared dataset and partitioning options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    // Number of samples in the shared dataset.
    pub num_samples: usize,
    // Feature width of each sample.
    pub feature_dim: usize,
    // Number of target classes.
    pub num_classes: usize,
    // Seed for generating the synthetic dataset (identical on every rank).
    pub data_seed: u64,
    // Seed mixed with the epoch number to derive each epoch's permutation.
    pub base_seed: u64,
    // Samples per local step.
    pub batch_size: usize,
}

// Epoch loop options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub epochs: u64,
    pub learning_rate: f64,
    // Emit a progress line every N local steps.
    pub log_every: usize,
    // Stop once the reduced epoch accuracy reaches this percentage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_accuracy_pct: Option<f64>,
}

// Checkpoint and results options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Directory for per-epoch checkpoint artifacts.
    pub checkpoint_dir: PathBuf,
    // Job identifier used to name artifacts. Agreed across ranks when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    // Job whose artifacts a resume reads. Defaults to `job_id`, so a
    // resubmitted job can continue from its predecessor's checkpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_job_id: Option<String>,
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    // Compression level (algorithm-specific).
    pub compression_level: i32,
    // Whether to use atomic writes (write to temp then rename).
    pub atomic_writes: bool,
    // The single rank that persists checkpoints and results.
    pub elected_rank: usize,
    // Directory for the per-epoch results artifact.
    pub results_dir: PathBuf,
}

// Per-rank logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    // Directory holding one log file per rank.
    pub log_dir: PathBuf,
    // Default filter directive when RUST_LOG is unset.
    pub level: String,
    // Mirror log lines to stderr.
    pub stderr: bool,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            join_timeout_ms: 300_000,
            collective_timeout_ms: None,
            connect_retry_ms: 200,
        }
    }
}

impl RendezvousConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn collective_timeout(&self) -> Option<Duration> {
        self.collective_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            num_samples: 10_000,
            feature_dim: 20,
            num_classes: 2,
            data_seed: 42,
            base_seed: 0,
            batch_size: 32,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 0.001,
            log_every: 10,
            target_accuracy_pct: None,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./models"),
            job_id: None,
            resume_job_id: None,
            compression: "lz4".to_string(),
            compression_level: 1,
            atomic_writes: true,
            elected_rank: 0,
            results_dir: PathBuf::from("./results"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs/nodes"),
            level: "info".to_string(),
            stderr: true,
        }
    }
}

impl FromStr for TrainingConfig {
    type Err = RuntimeError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| RuntimeError::configuration_with_source("failed to parse TOML config", e))
    }
}

impl TrainingConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::configuration_with_source(
                format!("failed to read config file {}", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    // Apply overrides from an arbitrary lookup.
    //
    // `DDP_`-prefixed variables take precedence over the conventional
    // `MASTER_ADDR` / `MASTER_PORT` pair. Values that fail to parse are
    // ignored and the previous value is kept.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        // Rendezvous overrides
        if let Some(val) = lookup("MASTER_ADDR") {
            self.rendezvous.master_addr = val;
        }
        if let Some(v) = lookup("MASTER_PORT").and_then(|v| v.parse().ok()) {
            self.rendezvous.master_port = v;
        }
        if let Some(val) = lookup("DDP_MASTER_ADDR") {
            self.rendezvous.master_addr = val;
        }
        if let Some(v) = lookup("DDP_MASTER_PORT").and_then(|v| v.parse().ok()) {
            self.rendezvous.master_port = v;
        }
        if let Some(v) = lookup("DDP_JOIN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.rendezvous.join_timeout_ms = v;
        }
        if let Some(val) = lookup("DDP_COLLECTIVE_TIMEOUT_MS") {
            match val.trim() {
                "" | "none" | "0" => self.rendezvous.collective_timeout_ms = None,
                other => {
                    if let Ok(v) = other.parse() {
                        self.rendezvous.collective_timeout_ms = Some(v);
                    }
                }
            }
        }

        // Dataset overrides
        if let Some(v) = lookup("DDP_DATASET_NUM_SAMPLES").and_then(|v| v.parse().ok()) {
            self.dataset.num_samples = v;
        }
        if let Some(v) = lookup("DDP_DATASET_BASE_SEED").and_then(|v| v.parse().ok()) {
            self.dataset.base_seed = v;
        }
        if let Some(v) = lookup("DDP_DATASET_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.dataset.batch_size = v;
        }

        // Training overrides
        if let Some(v) = lookup("DDP_TRAINING_EPOCHS").and_then(|v| v.parse().ok()) {
            self.training.epochs = v;
        }
        if let Some(v) = lookup("DDP_TRAINING_LEARNING_RATE").and_then(|v| v.parse().ok()) {
            self.training.learning_rate = v;
        }

        // Checkpoint overrides
        if let Some(val) = lookup("DDP_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("DDP_CHECKPOINT_JOB_ID") {
            self.checkpoint.job_id = Some(val);
        }
        if let Some(val) = lookup("DDP_CHECKPOINT_RESUME_JOB_ID") {
            self.checkpoint.resume_job_id = Some(val);
        }
        if let Some(val) = lookup("DDP_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        if let Some(val) = lookup("DDP_RESULTS_DIR") {
            self.checkpoint.results_dir = PathBuf::from(val);
        }

        // Logging overrides
        if let Some(val) = lookup("DDP_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("DDP_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    // Validate all configuration values that do not depend on placement.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Rendezvous validation
        if self.rendezvous.master_addr.is_empty() {
            return Err(RuntimeError::configuration(
                "rendezvous.master_addr must not be empty",
            ));
        }
        if self.rendezvous.join_timeout_ms == 0 {
            return Err(RuntimeError::configuration(
                "rendezvous.join_timeout_ms must be greater than 0",
            ));
        }
        if self.rendezvous.collective_timeout_ms == Some(0) {
            return Err(RuntimeError::configuration(
                "rendezvous.collective_timeout_ms must be greater than 0 when set",
            ));
        }

        // Dataset validation
        if self.dataset.num_samples == 0 {
            return Err(RuntimeError::configuration(
                "dataset.num_samples must be greater than 0",
            ));
        }
        if self.dataset.feature_dim == 0 {
            return Err(RuntimeError::configuration(
                "dataset.feature_dim must be greater than 0",
            ));
        }
        if self.dataset.num_classes < 2 {
            return Err(RuntimeError::configuration(
                "dataset.num_classes must be at least 2",
            ));
        }
        if self.dataset.batch_size == 0 {
            return Err(RuntimeError::configuration(
                "dataset.batch_size must be greater than 0",
            ));
        }

        // Training validation
        if self.training.epochs == 0 {
            return Err(RuntimeError::configuration(
                "training.epochs must be greater than 0",
            ));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(RuntimeError::configuration(
                "training.learning_rate must be greater than 0",
            ));
        }
        if self.training.log_every == 0 {
            return Err(RuntimeError::configuration(
                "training.log_every must be greater than 0",
            ));
        }
        if let Some(target) = self.training.target_accuracy_pct {
            if !(0.0..=100.0).contains(&target) {
                return Err(RuntimeError::configuration(
                    "training.target_accuracy_pct must be within 0..=100",
                ));
            }
        }

        // Checkpoint validation
        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(RuntimeError::configuration(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }
        for (field, job_id) in [
            ("job_id", &self.checkpoint.job_id),
            ("resume_job_id", &self.checkpoint.resume_job_id),
        ] {
            if let Some(job_id) = job_id {
                if job_id.is_empty() || job_id.contains(['/', '\\']) {
                    return Err(RuntimeError::configuration(format!(
                        "checkpoint.{field} must be a non-empty name without path separators"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate the settings that depend on the resolved placement.
    pub fn validate_for(&self, topology: &Topology) -> Result<()> {
        self.validate()?;
        if self.checkpoint.elected_rank >= topology.world_size() {
            return Err(RuntimeError::configuration(format!(
                "checkpoint.elected_rank {} is outside a world of size {}",
                self.checkpoint.elected_rank,
                topology.world_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();

        assert_eq!(config.rendezvous.master_addr, "127.0.0.1");
        assert_eq!(config.rendezvous.master_port, 29500);
        assert!(config.rendezvous.collective_timeout_ms.is_none());

        assert_eq!(config.dataset.num_samples, 10_000);
        assert_eq!(config.dataset.feature_dim, 20);
        assert_eq!(config.dataset.batch_size, 32);

        assert_eq!(config.training.epochs, 10);
        assert_eq!(config.training.learning_rate, 0.001);

        assert_eq!(config.checkpoint.compression, "lz4");
        assert_eq!(config.checkpoint.elected_rank, 0);
        assert!(config.checkpoint.atomic_writes);
        assert!(config.checkpoint.job_id.is_none());
    }

    #[test]
    fn test_default_validates() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [dataset]
            num_samples = 500
            batch_size = 8

            [rendezvous]
            collective_timeout_ms = 30000
        "#;
        let config: TrainingConfig = toml.parse().unwrap();

        assert_eq!(config.dataset.num_samples, 500);
        assert_eq!(config.dataset.batch_size, 8);
        // Untouched fields keep their defaults
        assert_eq!(config.dataset.feature_dim, 20);
        assert_eq!(config.rendezvous.collective_timeout_ms, Some(30_000));
        assert_eq!(
            config.rendezvous.collective_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.training.epochs, 10);
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<TrainingConfig, _> = "epochs = [".parse();
        assert!(matches!(result, Err(RuntimeError::Configuration { .. })));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [checkpoint]
            checkpoint_dir = "/shared/models"
            job_id = "job-17"
            "#
        )
        .unwrap();

        let config = TrainingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.checkpoint.checkpoint_dir, PathBuf::from("/shared/models"));
        assert_eq!(config.checkpoint.job_id.as_deref(), Some("job-17"));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = TrainingConfig::from_file("/nonexistent/ddp.toml");
        assert!(matches!(result, Err(RuntimeError::Configuration { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrainingConfig::default();
        config.dataset.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.checkpoint.compression = "gzip".to_string();
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.rendezvous.join_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.rendezvous.collective_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.checkpoint.job_id = Some("../escape".to_string());
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.checkpoint.resume_job_id = Some(String::new());
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.training.target_accuracy_pct = Some(120.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_for_checks_elected_rank() {
        let topology = Topology::single("host-a");
        let mut config = TrainingConfig::default();
        assert!(config.validate_for(&topology).is_ok());

        config.checkpoint.elected_rank = 1;
        let err = config.validate_for(&topology).unwrap_err();
        assert!(err.to_string().contains("elected_rank"));
    }

    #[test]
    fn test_env_overrides() {
        let lookup = lookup_from(&[
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "1234"),
            ("DDP_MASTER_PORT", "4321"),
            ("DDP_DATASET_BATCH_SIZE", "64"),
            ("DDP_TRAINING_EPOCHS", "3"),
            ("DDP_CHECKPOINT_JOB_ID", "slurm-99"),
            ("DDP_CHECKPOINT_RESUME_JOB_ID", "slurm-98"),
            ("DDP_COLLECTIVE_TIMEOUT_MS", "5000"),
            ("DDP_LOG_LEVEL", "debug"),
        ]);
        let config = TrainingConfig::default().with_overrides_from(lookup);

        assert_eq!(config.rendezvous.master_addr, "10.0.0.1");
        // DDP_ prefix wins over the conventional variable
        assert_eq!(config.rendezvous.master_port, 4321);
        assert_eq!(config.dataset.batch_size, 64);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.checkpoint.job_id.as_deref(), Some("slurm-99"));
        assert_eq!(config.checkpoint.resume_job_id.as_deref(), Some("slurm-98"));
        assert_eq!(config.rendezvous.collective_timeout_ms, Some(5000));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_env_overrides_ignore_unparseable_values() {
        let lookup = lookup_from(&[
            ("DDP_DATASET_BATCH_SIZE", "not_a_number"),
            ("DDP_MASTER_PORT", "99999999"),
        ]);
        let config = TrainingConfig::default().with_overrides_from(lookup);
        assert_eq!(config.dataset.batch_size, 32);
        assert_eq!(config.rendezvous.master_port, 29500);
    }

    #[test]
    fn test_collective_timeout_can_be_cleared() {
        let mut config = TrainingConfig::default();
        config.rendezvous.collective_timeout_ms = Some(100);
        let config = config.with_overrides_from(lookup_from(&[("DDP_COLLECTIVE_TIMEOUT_MS", "none")]));
        assert!(config.rendezvous.collective_timeout_ms.is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = TrainingConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: TrainingConfig = toml_str.parse().unwrap();

        assert_eq!(original.rendezvous.master_port, parsed.rendezvous.master_port);
        assert_eq!(original.dataset.base_seed, parsed.dataset.base_seed);
        assert_eq!(original.checkpoint.compression, parsed.checkpoint.compression);
        assert_eq!(original.logging.log_dir, parsed.logging.log_dir);
    }
}
