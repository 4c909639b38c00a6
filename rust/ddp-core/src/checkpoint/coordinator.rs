// rust/ddp-core/src/checkpoint/coordinator.rs

//! Elected-rank checkpointing.
//!
//! Exactly one rank (the elected rank) touches checkpoint and results
//! storage. Every outcome it observes is broadcast, so all ranks agree on
//! whether an epoch was persisted and on what a resume loaded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::collective::ProcessGroup;
use crate::config::CheckpointConfig;
use crate::error::{Result, RuntimeError};
use crate::storage::StorageBackend;
use crate::trainer::EpochMetrics;

use super::reader::CheckpointReader;
use super::record::Checkpoint;
use super::results::ResultsLog;
use super::writer::CheckpointWriter;

/// Which checkpoint a resume should load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeTarget {
    /// The highest published epoch, or a fresh start if there is none.
    Latest,
    /// Exactly this epoch; missing is an error.
    Epoch(u64),
}

/// Where training continues after a resume.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub next_epoch: u64,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Serialize, Deserialize)]
enum PersistStatus {
    Written { path: PathBuf },
    Failed { reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
enum ResumeStatus {
    /// Sealed artifact bytes; every rank verifies them itself.
    /// `continue_as` is the job later epochs are written under.
    Loaded {
        epoch: u64,
        artifact: Vec<u8>,
        continue_as: String,
    },
    NotFound,
    Failed { reason: String },
}

pub struct CheckpointCoordinator {
    job_id: String,
    resume_job_id: String,
    elected_rank: usize,
    device_kind: String,
    writer: CheckpointWriter,
    reader: CheckpointReader,
    // Only the elected rank keeps a results log.
    results: Option<ResultsLog>,
}

impl CheckpointCoordinator {
    /// Agrees on a job identifier and prepares the elected rank's writers.
    ///
    /// The identifier is the configured `job_id`, else `SLURM_JOB_ID`, else a
    /// fresh UUID, always as seen by the elected rank and broadcast from it.
    /// Resumes read from `resume_job_id` when set, else from the same job.
    pub fn establish(
        group: &mut ProcessGroup,
        config: &CheckpointConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        Self::establish_with(group, config, storage, |key| std::env::var(key).ok())
    }

    pub(crate) fn establish_with(
        group: &mut ProcessGroup,
        config: &CheckpointConfig,
        storage: Arc<dyn StorageBackend>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let elected_rank = config.elected_rank;
        if elected_rank >= group.world_size() {
            return Err(RuntimeError::configuration(format!(
                "checkpoint.elected_rank {elected_rank} is outside a world of size {}",
                group.world_size()
            )));
        }

        let is_elected = group.rank() == elected_rank;
        let proposal = is_elected.then(|| {
            let job_id = config
                .job_id
                .clone()
                .or_else(|| lookup("SLURM_JOB_ID").filter(|id| !id.trim().is_empty()))
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let resume_job_id = config.resume_job_id.clone().unwrap_or_else(|| job_id.clone());
            (job_id, resume_job_id)
        });
        let (job_id, resume_job_id): (String, String) = group.broadcast(proposal, elected_rank)?;

        info!(%job_id, %resume_job_id, elected_rank, "checkpoint coordinator ready");

        Ok(Self {
            job_id,
            resume_job_id,
            elected_rank,
            device_kind: "cpu".to_string(),
            writer: CheckpointWriter::new(storage.clone(), config.clone()),
            reader: CheckpointReader::new(storage.clone(), &config.checkpoint_dir),
            results: is_elected.then(|| ResultsLog::new(storage, &config.results_dir)),
        })
    }

    /// Device kind recorded in written checkpoints.
    #[must_use]
    pub fn with_device_kind(mut self, kind: &str) -> Self {
        self.device_kind = kind.to_string();
        self
    }

    /// Job new artifacts are written under. May change on a resume.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn resume_job_id(&self) -> &str {
        &self.resume_job_id
    }

    pub fn elected_rank(&self) -> usize {
        self.elected_rank
    }

    pub fn results_path(&self) -> Option<&std::path::Path> {
        self.results.as_ref().map(ResultsLog::path)
    }

    /// Persists the end-of-epoch state on the elected rank.
    ///
    /// Collective: every rank must call it for every epoch. Returns the
    /// artifact path on every rank, or `CheckpointIo` on every rank if the
    /// elected rank failed to persist.
    pub fn maybe_checkpoint(
        &mut self,
        group: &mut ProcessGroup,
        epoch: u64,
        model_state: &[u8],
        optimizer_state: &[u8],
        metrics: &EpochMetrics,
    ) -> Result<PathBuf> {
        let status = if group.rank() == self.elected_rank {
            Some(
                match self.persist(group, epoch, model_state, optimizer_state, metrics) {
                    Ok(path) => PersistStatus::Written { path },
                    Err(e) => {
                        warn!(epoch, error = %e, "failed to persist checkpoint");
                        PersistStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                },
            )
        } else {
            None
        };

        match group.broadcast(status, self.elected_rank)? {
            PersistStatus::Written { path } => Ok(path),
            PersistStatus::Failed { reason } => Err(RuntimeError::checkpoint_io(format!(
                "rank {} failed to persist epoch {epoch}: {reason}",
                self.elected_rank
            ))),
        }
    }

    fn persist(
        &self,
        group: &ProcessGroup,
        epoch: u64,
        model_state: &[u8],
        optimizer_state: &[u8],
        metrics: &EpochMetrics,
    ) -> Result<PathBuf> {
        let checkpoint = Checkpoint {
            epoch,
            model_state: model_state.to_vec(),
            optimizer_state: optimizer_state.to_vec(),
            loss: metrics.mean_loss,
            device_kind: self.device_kind.clone(),
        };
        let mut metadata = HashMap::new();
        metadata.insert("world_size".to_string(), group.world_size().to_string());
        metadata.insert("host".to_string(), group.topology().host_id().to_string());
        metadata.insert("accuracy_pct".to_string(), format!("{:.2}", metrics.accuracy_pct));

        let path = self.writer.write(&self.job_id, &checkpoint, metadata)?;
        // Only epochs with an artifact behind them get a results line.
        if let Some(results) = &self.results {
            results.append(metrics)?;
        }
        Ok(path)
    }

    /// Loads a checkpoint of the resume job on the elected rank and
    /// distributes it.
    ///
    /// Collective. `Ok(None)` means there is nothing to resume from and
    /// training starts fresh; only possible with [`ResumeTarget::Latest`].
    ///
    /// Artifacts are never overwritten, so when the write job already holds
    /// epochs past the loaded one (a rollback), later epochs go to a new
    /// branch job `<job>-from<epoch>-<suffix>` agreed by every rank.
    pub fn resume(
        &mut self,
        group: &mut ProcessGroup,
        target: ResumeTarget,
    ) -> Result<Option<ResumePoint>> {
        let status = (group.rank() == self.elected_rank).then(|| self.load(target));

        match group.broadcast(status, self.elected_rank)? {
            ResumeStatus::Loaded {
                epoch,
                artifact,
                continue_as,
            } => {
                let checkpoint = CheckpointReader::decode(&artifact)?;
                if checkpoint.epoch != epoch {
                    return Err(RuntimeError::checkpoint_io(format!(
                        "requested epoch {epoch} but artifact holds epoch {}",
                        checkpoint.epoch
                    )));
                }
                info!(epoch, job_id = %self.resume_job_id, "resuming from checkpoint");
                if continue_as != self.job_id {
                    warn!(
                        previous = %self.job_id,
                        job_id = %continue_as,
                        "later epochs already exist, writing to a branch job"
                    );
                    self.job_id = continue_as;
                }
                Ok(Some(ResumePoint {
                    next_epoch: epoch + 1,
                    checkpoint,
                }))
            }
            ResumeStatus::NotFound => match target {
                ResumeTarget::Latest => {
                    info!(job_id = %self.resume_job_id, "no checkpoint to resume from, starting fresh");
                    Ok(None)
                }
                ResumeTarget::Epoch(epoch) => Err(RuntimeError::checkpoint_io(format!(
                    "no checkpoint for epoch {epoch} of job {}",
                    self.resume_job_id
                ))),
            },
            ResumeStatus::Failed { reason } => Err(RuntimeError::checkpoint_io(format!(
                "rank {} failed to load checkpoint: {reason}",
                self.elected_rank
            ))),
        }
    }

    fn load(&self, target: ResumeTarget) -> ResumeStatus {
        let source = &self.resume_job_id;
        let epoch = match target {
            ResumeTarget::Latest => self.reader.latest_epoch(source),
            ResumeTarget::Epoch(epoch) => self
                .reader
                .epochs(source)
                .map(|epochs| epochs.contains(&epoch).then_some(epoch)),
        };

        let result = epoch.and_then(|epoch| match epoch {
            Some(epoch) => {
                let artifact = self.reader.read_bytes(&self.reader.path_for(source, epoch))?;
                let continue_as = self.continuation_job(epoch)?;
                Ok(ResumeStatus::Loaded {
                    epoch,
                    artifact,
                    continue_as,
                })
            }
            None => Ok(ResumeStatus::NotFound),
        });

        result.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load checkpoint");
            ResumeStatus::Failed {
                reason: e.to_string(),
            }
        })
    }

    /// Job to write under after resuming from `epoch`.
    fn continuation_job(&self, epoch: u64) -> Result<String> {
        let written = self.reader.epochs(&self.job_id)?;
        if written.iter().all(|&e| e <= epoch) {
            return Ok(self.job_id.clone());
        }
        let suffix = Uuid::new_v4().simple().to_string();
        Ok(format!("{}-from{epoch:05}-{}", self.job_id, &suffix[..8]))
    }
}
