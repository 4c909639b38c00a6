// rust/ddp-core/src/trainer/synchronized.rs

use std::path::PathBuf;

use tracing::{debug, info};

use crate::checkpoint::{CheckpointCoordinator, ResumeTarget};
use crate::collective::{ProcessGroup, ReduceOp};
use crate::config::TrainingConfig;
use crate::dataset::{Dataset, EpochShard};
use crate::error::{Result, RuntimeError};

use super::metrics::{EpochMetrics, RunningTotals};
use super::traits::{Optimizer, TrainableModule};

/// Where the trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    Training { epoch: u64 },
    SynchronizingGradients { epoch: u64, step: usize },
    CheckpointBarrier { epoch: u64 },
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerOptions {
    /// Total epochs, counting any already completed before a resume.
    pub epochs: u64,
    pub batch_size: usize,
    /// Partitioner seed shared by every rank
    pub base_seed: u64,
    pub log_every: usize,
    pub target_accuracy_pct: Option<f64>,
}

impl TrainerOptions {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.training.epochs,
            batch_size: config.dataset.batch_size,
            base_seed: config.dataset.base_seed,
            log_every: config.training.log_every,
            target_accuracy_pct: config.training.target_accuracy_pct,
        }
    }
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self::from_config(&TrainingConfig::default())
    }
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub start_epoch: u64,
    /// Metrics of every epoch trained in this run, in order
    pub epochs: Vec<EpochMetrics>,
    pub stopped_early: bool,
    pub last_checkpoint: Option<PathBuf>,
}

/// Drives synchronous data-parallel training on one rank.
///
/// Every rank runs the same sequence of collectives: a parameter broadcast
/// at the start, one gradient all-reduce per step, and per epoch a barrier,
/// a metrics all-reduce, the checkpoint status broadcast and the early-stop
/// broadcast. Shards have equal length on every rank, so step counts match.
pub struct SynchronizedTrainer {
    options: TrainerOptions,
    coordinator: CheckpointCoordinator,
    state: TrainerState,
    start_epoch: u64,
}

impl SynchronizedTrainer {
    pub fn new(options: TrainerOptions, coordinator: CheckpointCoordinator) -> Self {
        Self {
            options,
            coordinator,
            state: TrainerState::Initializing,
            start_epoch: 0,
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn coordinator(&self) -> &CheckpointCoordinator {
        &self.coordinator
    }

    /// First epoch `run` will train.
    pub fn start_epoch(&self) -> u64 {
        self.start_epoch
    }

    /// Restores model and optimizer state from a checkpoint. Collective.
    ///
    /// Returns the epoch training continues at, or `None` when there was
    /// nothing to resume from.
    pub fn resume<M, O>(
        &mut self,
        group: &mut ProcessGroup,
        target: ResumeTarget,
        model: &mut M,
        optimizer: &mut O,
    ) -> Result<Option<u64>>
    where
        M: TrainableModule + ?Sized,
        O: Optimizer + ?Sized,
    {
        let Some(point) = self.coordinator.resume(group, target)? else {
            return Ok(None);
        };

        model.load_state_dict(&point.checkpoint.model_state)?;
        optimizer.load_state_dict(&point.checkpoint.optimizer_state)?;
        self.start_epoch = point.next_epoch;

        info!(
            next_epoch = point.next_epoch,
            loss = point.checkpoint.loss,
            device = %point.checkpoint.device_kind,
            "restored model and optimizer state"
        );
        Ok(Some(point.next_epoch))
    }

    /// Trains from the start epoch up to `options.epochs`. Collective.
    pub fn run<M, O, D>(
        &mut self,
        group: &mut ProcessGroup,
        model: &mut M,
        optimizer: &mut O,
        dataset: &D,
    ) -> Result<TrainingSummary>
    where
        M: TrainableModule + ?Sized,
        O: Optimizer + ?Sized,
        D: Dataset + ?Sized,
    {
        self.state = TrainerState::Initializing;
        self.sync_parameters(group, model)?;

        let mut summary = TrainingSummary {
            start_epoch: self.start_epoch,
            epochs: Vec::new(),
            stopped_early: false,
            last_checkpoint: None,
        };

        info!(
            start_epoch = self.start_epoch,
            epochs = self.options.epochs,
            dataset = dataset.len(),
            world_size = group.world_size(),
            "starting training"
        );

        for epoch in self.start_epoch..self.options.epochs {
            self.state = TrainerState::Training { epoch };
            let totals = self.train_epoch(group, model, optimizer, dataset, epoch)?;

            self.state = TrainerState::CheckpointBarrier { epoch };
            group.barrier()?;
            let metrics = totals.reduce(group, epoch)?;
            info!(
                epoch,
                loss = metrics.mean_loss,
                accuracy_pct = metrics.accuracy_pct,
                "epoch completed"
            );

            // Only the elected rank's state is persisted.
            let states = if group.rank() == self.coordinator.elected_rank() {
                model
                    .state_dict()
                    .and_then(|m| optimizer.state_dict().map(|o| (m, o)))
            } else {
                Ok((Vec::new(), Vec::new()))
            };
            let (model_state, optimizer_state) = states.map_err(|e| local_failure(group, e))?;
            let path = self.coordinator.maybe_checkpoint(
                group,
                epoch,
                &model_state,
                &optimizer_state,
                &metrics,
            )?;
            summary.last_checkpoint = Some(path);
            summary.epochs.push(metrics);

            if self.should_stop(group, &metrics)? {
                info!(epoch, "target accuracy reached, stopping early");
                summary.stopped_early = true;
                break;
            }
        }

        self.state = TrainerState::Completed;
        Ok(summary)
    }

    /// Makes every rank start from the elected rank's parameters.
    fn sync_parameters<M>(&self, group: &mut ProcessGroup, model: &mut M) -> Result<()>
    where
        M: TrainableModule + ?Sized,
    {
        let elected = self.coordinator.elected_rank();
        let source = (group.rank() == elected).then(|| model.parameters().to_vec());
        let params: Vec<f32> = group.broadcast(source, elected)?;

        let local = model.parameters_mut();
        if params.len() != local.len() {
            return Err(RuntimeError::collective(
                "broadcast",
                format!(
                    "rank {elected} has {} parameters, this rank has {}",
                    params.len(),
                    local.len()
                ),
            ));
        }
        local.copy_from_slice(&params);
        debug!(parameters = params.len(), "parameters synchronized");
        Ok(())
    }

    fn train_epoch<M, O, D>(
        &mut self,
        group: &mut ProcessGroup,
        model: &mut M,
        optimizer: &mut O,
        dataset: &D,
        epoch: u64,
    ) -> Result<RunningTotals>
    where
        M: TrainableModule + ?Sized,
        O: Optimizer + ?Sized,
        D: Dataset + ?Sized,
    {
        let shard = EpochShard::new(
            dataset.len(),
            epoch,
            group.rank(),
            group.world_size(),
            self.options.base_seed,
        )?;
        let num_batches = shard.num_batches(self.options.batch_size);
        let world_size = group.world_size() as f32;
        let log_every = self.options.log_every.max(1);
        let mut totals = RunningTotals::default();

        for (step, indices) in shard.batches(self.options.batch_size).enumerate() {
            let local = dataset.batch(indices).and_then(|batch| {
                optimizer.zero_grad(model.gradients_mut());
                model.compute_gradients(&batch)
            });
            let local = match local {
                Ok(local) => local,
                Err(e) => return Err(local_failure(group, e)),
            };

            self.state = TrainerState::SynchronizingGradients { epoch, step };
            group.all_reduce_in_place(model.gradients_mut(), ReduceOp::Sum)?;
            for g in model.gradients_mut() {
                *g /= world_size;
            }

            let (params, grads) = model.split_mut();
            if let Err(e) = optimizer.step(params, grads) {
                return Err(local_failure(group, e));
            }
            totals.record(&local);
            self.state = TrainerState::Training { epoch };

            if step % log_every == 0 {
                info!(
                    epoch,
                    batch = step,
                    batches = num_batches,
                    loss = local.loss,
                    accuracy_pct = totals.accuracy_pct(),
                    "training progress"
                );
            }
        }

        Ok(totals)
    }

    /// The elected rank decides; everyone follows.
    fn should_stop(&self, group: &mut ProcessGroup, metrics: &EpochMetrics) -> Result<bool> {
        let elected = self.coordinator.elected_rank();
        let decision = (group.rank() == elected).then(|| {
            self.options
                .target_accuracy_pct
                .is_some_and(|target| metrics.accuracy_pct >= target)
        });
        group.broadcast(decision, elected)
    }
}

/// Attributes a local failure to this rank and tells the peers.
fn local_failure(group: &mut ProcessGroup, error: RuntimeError) -> RuntimeError {
    let rank = group.rank();
    let error = match error {
        RuntimeError::LocalCompute { message, .. } => RuntimeError::local_compute(rank, message),
        other => RuntimeError::local_compute(rank, other.to_string()),
    };
    group.abort(&error.to_string());
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::testing::run_local;
    use crate::config::CheckpointConfig;
    use crate::dataset::{Batch, SyntheticDataset};
    use crate::storage::{LocalStorage, StorageBackend};
    use crate::trainer::reference::{Adam, LinearClassifier};
    use crate::trainer::traits::LocalStep;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn options(epochs: u64) -> TrainerOptions {
        TrainerOptions {
            epochs,
            batch_size: 8,
            base_seed: 3,
            log_every: 2,
            target_accuracy_pct: None,
        }
    }

    fn checkpoint_config() -> CheckpointConfig {
        CheckpointConfig {
            checkpoint_dir: PathBuf::from("models"),
            results_dir: PathBuf::from("results"),
            job_id: Some("job".to_string()),
            ..CheckpointConfig::default()
        }
    }

    fn trainer(
        group: &mut ProcessGroup,
        storage: Arc<dyn StorageBackend>,
        options: TrainerOptions,
    ) -> SynchronizedTrainer {
        let coordinator =
            CheckpointCoordinator::establish(group, &checkpoint_config(), storage).unwrap();
        SynchronizedTrainer::new(options, coordinator)
    }

    fn param_bits(model: &LinearClassifier) -> Vec<u32> {
        model.parameters().iter().map(|p| p.to_bits()).collect()
    }

    /// Fails its `fail_at`-th gradient computation on `fail_rank`.
    struct FlakyModel {
        inner: LinearClassifier,
        rank: usize,
        fail_rank: usize,
        fail_at: usize,
        calls: usize,
    }

    impl TrainableModule for FlakyModel {
        fn forward(&self, batch: &Batch) -> Result<Vec<u32>> {
            self.inner.forward(batch)
        }

        fn compute_gradients(&mut self, batch: &Batch) -> Result<LocalStep> {
            self.calls += 1;
            if self.rank == self.fail_rank && self.calls == self.fail_at {
                return Err(RuntimeError::local_compute(0, "malformed batch"));
            }
            self.inner.compute_gradients(batch)
        }

        fn parameters(&self) -> &[f32] {
            self.inner.parameters()
        }

        fn parameters_mut(&mut self) -> &mut [f32] {
            self.inner.parameters_mut()
        }

        fn gradients_mut(&mut self) -> &mut [f32] {
            self.inner.gradients_mut()
        }

        fn split_mut(&mut self) -> (&mut [f32], &[f32]) {
            self.inner.split_mut()
        }

        fn state_dict(&self) -> Result<Vec<u8>> {
            self.inner.state_dict()
        }

        fn load_state_dict(&mut self, state: &[u8]) -> Result<()> {
            self.inner.load_state_dict(state)
        }
    }

    #[test]
    fn test_parameters_stay_bit_identical() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(temp.path()).unwrap());

        let outcomes = run_local(3, move |mut group| {
            let dataset = SyntheticDataset::generate(50, 4, 1);
            // Different init per rank; the start broadcast aligns them.
            let mut model = LinearClassifier::new(4, 2, group.rank() as u64);
            let mut adam = Adam::new(0.01);
            let mut trainer = trainer(&mut group, storage.clone(), options(2));
            assert_eq!(trainer.state(), TrainerState::Initializing);

            let summary = trainer
                .run(&mut group, &mut model, &mut adam, &dataset)
                .unwrap();
            assert_eq!(trainer.state(), TrainerState::Completed);
            group.leave().unwrap();
            (param_bits(&model), summary)
        });

        let (params, summary) = &outcomes[0];
        assert_eq!(summary.start_epoch, 0);
        assert_eq!(summary.epochs.len(), 2);
        assert!(!summary.stopped_early);
        assert!(summary.last_checkpoint.is_some());
        for (other_params, other_summary) in &outcomes[1..] {
            assert_eq!(other_params, params);
            assert_eq!(other_summary, summary);
        }
    }

    #[test]
    fn test_compute_failure_reaches_every_rank() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(temp.path()).unwrap());

        let outcomes = run_local(3, move |mut group| {
            let dataset = SyntheticDataset::generate(60, 4, 1);
            let mut model = FlakyModel {
                inner: LinearClassifier::new(4, 2, 0),
                rank: group.rank(),
                fail_rank: 1,
                fail_at: 2,
                calls: 0,
            };
            let mut adam = Adam::new(0.01);
            let mut trainer = trainer(&mut group, storage.clone(), options(1));
            trainer.run(&mut group, &mut model, &mut adam, &dataset)
        });

        for (rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Err(RuntimeError::LocalCompute { rank: failed, message }) => {
                    assert_eq!(rank, 1);
                    assert_eq!(failed, 1);
                    assert_eq!(message, "malformed batch");
                }
                Err(RuntimeError::CollectiveFailure { message, .. }) => {
                    assert_ne!(rank, 1);
                    assert!(message.contains("rank 1"), "{message}");
                }
                other => panic!("rank {rank}: unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let resumed_dir = TempDir::new().unwrap();
        let straight_dir = TempDir::new().unwrap();
        let resumed: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(resumed_dir.path()).unwrap());
        let straight: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(straight_dir.path()).unwrap());

        let outcomes = run_local(2, move |mut group| {
            let dataset = SyntheticDataset::generate(40, 4, 2);

            // Two epochs, then a fresh process state resumes for two more.
            let mut model = LinearClassifier::new(4, 2, 0);
            let mut adam = Adam::new(0.01);
            trainer(&mut group, resumed.clone(), options(2))
                .run(&mut group, &mut model, &mut adam, &dataset)
                .unwrap();

            let mut model = LinearClassifier::new(4, 2, 99);
            let mut adam = Adam::new(0.01);
            let mut second = trainer(&mut group, resumed.clone(), options(4));
            let next = second
                .resume(&mut group, ResumeTarget::Latest, &mut model, &mut adam)
                .unwrap();
            let summary = second
                .run(&mut group, &mut model, &mut adam, &dataset)
                .unwrap();

            let mut reference = LinearClassifier::new(4, 2, 0);
            let mut reference_adam = Adam::new(0.01);
            trainer(&mut group, straight.clone(), options(4))
                .run(&mut group, &mut reference, &mut reference_adam, &dataset)
                .unwrap();

            group.leave().unwrap();
            (next, summary, param_bits(&model), param_bits(&reference))
        });

        for (next, summary, resumed_params, straight_params) in outcomes {
            assert_eq!(next, Some(2));
            assert_eq!(summary.start_epoch, 2);
            let epochs: Vec<u64> = summary.epochs.iter().map(|m| m.epoch).collect();
            assert_eq!(epochs, vec![2, 3]);
            assert_eq!(resumed_params, straight_params);
        }
    }

    #[test]
    fn test_early_stop_is_shared() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(temp.path()).unwrap());

        let outcomes = run_local(2, move |mut group| {
            let dataset = SyntheticDataset::generate(32, 4, 1);
            let mut model = LinearClassifier::new(4, 2, 0);
            let mut adam = Adam::new(0.01);
            let options = TrainerOptions {
                target_accuracy_pct: Some(0.0),
                ..options(5)
            };
            let summary = trainer(&mut group, storage.clone(), options)
                .run(&mut group, &mut model, &mut adam, &dataset)
                .unwrap();
            group.leave().unwrap();
            summary
        });

        for summary in outcomes {
            assert!(summary.stopped_early);
            assert_eq!(summary.epochs.len(), 1);
        }
    }

    #[test]
    fn test_resume_without_checkpoint_starts_fresh() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(temp.path()).unwrap());

        let outcomes = run_local(1, move |mut group| {
            let mut model = LinearClassifier::new(4, 2, 0);
            let mut adam = Adam::new(0.01);
            let mut trainer = trainer(&mut group, storage.clone(), options(1));
            let next = trainer
                .resume(&mut group, ResumeTarget::Latest, &mut model, &mut adam)
                .unwrap();
            group.leave().unwrap();
            (next, trainer.start_epoch())
        });
        assert_eq!(outcomes, vec![(None, 0)]);
    }
}
