// rust/ddp-worker/src/worker.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use ddp_core::checkpoint::{CheckpointCoordinator, ResumeTarget};
use ddp_core::collective::{Backend, LocalCluster, ProcessGroup};
use ddp_core::config::TrainingConfig;
use ddp_core::dataset::SyntheticDataset;
use ddp_core::logging::RankLogger;
use ddp_core::storage::{LocalStorage, StorageBackend};
use ddp_core::topology::{detect_accelerators, select_device, PlacementMetadata, Topology};
use ddp_core::trainer::reference::{Adam, LinearClassifier};
use ddp_core::trainer::{SynchronizedTrainer, TrainerOptions, TrainingSummary};
use ddp_core::{Result, RuntimeError};
use tracing::{error, info};

/// Command-line choices shared by `run` and `simulate`.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub config_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub resume: Option<ResumeTarget>,
    pub resume_job_id: Option<String>,
}

/// File config, then `DDP_*` overrides, then command-line flags.
pub fn load_config(options: &WorkerOptions) -> Result<TrainingConfig> {
    let config = match &options.config_path {
        Some(path) => TrainingConfig::from_file(path)?,
        None => TrainingConfig::default(),
    };
    let mut config = config.with_env_overrides();
    if let Some(level) = &options.log_level {
        config.logging.level = level.clone();
    }
    if let Some(job_id) = &options.resume_job_id {
        config.checkpoint.resume_job_id = Some(job_id.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Runs this process as one rank of a job placed by the scheduler.
pub fn run_rank(options: &WorkerOptions) -> Result<TrainingSummary> {
    let config = load_config(options)?;
    // Placement problems are fatal before any rendezvous is attempted.
    let topology = Topology::resolve(PlacementMetadata::from_env())?;
    config.validate_for(&topology)?;

    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(".")?);
    train_rank(&config, &topology, Backend::Tcp, storage, options.resume)
}

/// Runs `world_size` ranks as threads of this process.
pub fn simulate(options: &WorkerOptions, world_size: usize) -> Result<Vec<TrainingSummary>> {
    let config = load_config(options)?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(".")?);
    simulate_with(&config, world_size, storage, options.resume)
}

pub(crate) fn simulate_with(
    config: &TrainingConfig,
    world_size: usize,
    storage: Arc<dyn StorageBackend>,
    resume: Option<ResumeTarget>,
) -> Result<Vec<TrainingSummary>> {
    if world_size == 0 {
        return Err(RuntimeError::configuration("world size must be at least 1"));
    }

    let mut handles = Vec::with_capacity(world_size);
    for (rank, endpoint) in LocalCluster::new(world_size).into_iter().enumerate() {
        let config = config.clone();
        let storage = storage.clone();
        let handle = thread::Builder::new()
            .name(format!("rank-{rank}"))
            .spawn(move || -> Result<TrainingSummary> {
                let topology = Topology::resolve(PlacementMetadata::explicit(
                    world_size, rank, rank, "local",
                ))?;
                config.validate_for(&topology)?;
                train_rank(
                    &config,
                    &topology,
                    Backend::InProcess(endpoint),
                    storage,
                    resume,
                )
            })
            .map_err(|e| RuntimeError::rendezvous(format!("failed to start rank {rank}: {e}")))?;
        handles.push(handle);
    }

    let outcomes: Vec<Result<TrainingSummary>> = handles
        .into_iter()
        .enumerate()
        .map(|(rank, handle)| {
            handle
                .join()
                .unwrap_or_else(|_| Err(RuntimeError::local_compute(rank, "rank thread panicked")))
        })
        .collect();

    // Peers of a failed rank only see a collective failure; report the cause.
    if outcomes.iter().any(|outcome| outcome.is_err()) {
        let mut errors: Vec<RuntimeError> = outcomes.into_iter().filter_map(|o| o.err()).collect();
        let root = errors
            .iter()
            .position(|e| !matches!(e, RuntimeError::CollectiveFailure { .. }))
            .unwrap_or(0);
        return Err(errors.swap_remove(root));
    }
    outcomes.into_iter().collect()
}

/// One rank's full run with its log sink installed.
pub(crate) fn train_rank(
    config: &TrainingConfig,
    topology: &Topology,
    backend: Backend,
    storage: Arc<dyn StorageBackend>,
    resume: Option<ResumeTarget>,
) -> Result<TrainingSummary> {
    let _logger = RankLogger::install(&config.logging, topology, storage.clone())?;
    info!(
        node = topology.host_id(),
        rank = topology.rank(),
        world_size = topology.world_size(),
        "starting training on node"
    );

    let result = train(config, topology, backend, storage, resume);
    match &result {
        Ok(summary) => info!(
            epochs = summary.epochs.len(),
            stopped_early = summary.stopped_early,
            "training completed"
        ),
        Err(e) => error!(error = %e, exit_code = e.exit_code(), "training failed"),
    }
    result
}

fn train(
    config: &TrainingConfig,
    topology: &Topology,
    backend: Backend,
    storage: Arc<dyn StorageBackend>,
    resume: Option<ResumeTarget>,
) -> Result<TrainingSummary> {
    let device = select_device(topology, detect_accelerators());
    info!(%device, "device selected");

    // Dropping the group on an error path releases it.
    let mut group = ProcessGroup::join(topology, backend, &config.rendezvous)?;
    let coordinator = CheckpointCoordinator::establish(&mut group, &config.checkpoint, storage)?
        .with_device_kind(device.kind());

    let dataset = SyntheticDataset::generate(
        config.dataset.num_samples,
        config.dataset.feature_dim,
        config.dataset.data_seed,
    );
    let mut model = LinearClassifier::new(
        config.dataset.feature_dim,
        config.dataset.num_classes,
        config.dataset.base_seed,
    );
    let mut optimizer = Adam::new(config.training.learning_rate);
    info!(
        job_id = coordinator.job_id(),
        samples = config.dataset.num_samples,
        parameters = model.feature_dim() * model.num_classes() + model.num_classes(),
        "model initialized"
    );

    let mut trainer = SynchronizedTrainer::new(TrainerOptions::from_config(config), coordinator);
    if let Some(target) = resume {
        trainer.resume(&mut group, target, &mut model, &mut optimizer)?;
    }
    let summary = trainer.run(&mut group, &mut model, &mut optimizer, &dataset)?;
    if let Some(path) = trainer.coordinator().results_path() {
        info!(path = %path.display(), "results appended");
    }

    group.leave()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(root: &Path, epochs: u64) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.dataset.num_samples = 64;
        config.dataset.feature_dim = 4;
        config.dataset.batch_size = 8;
        config.training.epochs = epochs;
        config.training.learning_rate = 0.01;
        config.rendezvous.join_timeout_ms = 5_000;
        config.rendezvous.collective_timeout_ms = Some(5_000);
        config.checkpoint.checkpoint_dir = root.join("models");
        config.checkpoint.results_dir = root.join("results");
        config.checkpoint.job_id = Some("sim".to_string());
        config.logging.log_dir = root.join("logs");
        config.logging.stderr = false;
        config
    }

    fn storage(root: &Path) -> Arc<dyn StorageBackend> {
        Arc::new(LocalStorage::new(root).unwrap())
    }

    #[test]
    fn test_simulated_run_writes_artifacts() {
        let temp = TempDir::new().unwrap();
        let summaries = simulate_with(&config(temp.path(), 2), 3, storage(temp.path()), None).unwrap();

        assert_eq!(summaries.len(), 3);
        for summary in &summaries {
            assert_eq!(summary, &summaries[0]);
            assert_eq!(summary.epochs.len(), 2);
        }

        let mut checkpoints: Vec<String> = std::fs::read_dir(temp.path().join("models"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        checkpoints.sort();
        assert_eq!(checkpoints, vec!["sim_epoch_00000.ckpt", "sim_epoch_00001.ckpt"]);

        for rank in 0..3 {
            let log = temp.path().join("logs").join(format!("node_{rank}_local.log"));
            let content = std::fs::read_to_string(log).unwrap();
            assert!(content.contains("starting training on node"));
            assert!(content.contains(&format!("rank={rank}")));
        }

        let results: Vec<_> = std::fs::read_dir(temp.path().join("results")).unwrap().collect();
        assert_eq!(results.len(), 1);
        let path = results.into_iter().next().unwrap().unwrap().path();
        let lines = std::fs::read_to_string(path).unwrap();
        assert_eq!(lines.lines().count(), 2);
        assert!(lines.starts_with("Epoch: 0, Loss: "));
    }

    #[test]
    fn test_simulated_resume_continues() {
        let temp = TempDir::new().unwrap();
        simulate_with(&config(temp.path(), 2), 2, storage(temp.path()), None).unwrap();

        let summaries = simulate_with(
            &config(temp.path(), 3),
            2,
            storage(temp.path()),
            Some(ResumeTarget::Latest),
        )
        .unwrap();
        for summary in summaries {
            assert_eq!(summary.start_epoch, 2);
            assert_eq!(summary.epochs.len(), 1);
            assert_eq!(summary.epochs[0].epoch, 2);
        }
    }

    #[test]
    fn test_simulated_rollback_to_first_epoch() {
        let temp = TempDir::new().unwrap();
        simulate_with(&config(temp.path(), 3), 2, storage(temp.path()), None).unwrap();

        let summaries = simulate_with(
            &config(temp.path(), 3),
            2,
            storage(temp.path()),
            Some(ResumeTarget::Epoch(0)),
        )
        .unwrap();
        for summary in &summaries {
            assert_eq!(summary.start_epoch, 1);
            assert_eq!(summary.epochs.len(), 2);
            let last = summary.last_checkpoint.as_ref().unwrap();
            let name = last.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("sim-from00000-"));
            assert!(name.ends_with("_epoch_00002.ckpt"));
        }

        // The original run's artifacts are untouched.
        let originals = std::fs::read_dir(temp.path().join("models"))
            .unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_string_lossy().starts_with("sim_epoch_")
            })
            .count();
        assert_eq!(originals, 3);
    }

    #[test]
    fn test_missing_resume_epoch_fails_every_rank() {
        let temp = TempDir::new().unwrap();
        let err = simulate_with(
            &config(temp.path(), 1),
            2,
            storage(temp.path()),
            Some(ResumeTarget::Epoch(4)),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::CheckpointIo { .. }));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_zero_world_size_rejected() {
        let temp = TempDir::new().unwrap();
        let err = simulate_with(&config(temp.path(), 1), 0, storage(temp.path()), None).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_log_level_flag_overrides_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ddp.toml");
        std::fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();

        let options = WorkerOptions {
            config_path: Some(path),
            log_level: Some("debug".to_string()),
            resume: None,
            resume_job_id: Some("slurm-41".to_string()),
        };
        let config = load_config(&options).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.checkpoint.resume_job_id.as_deref(), Some("slurm-41"));
    }
}
