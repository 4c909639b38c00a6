// rust/ddp-core/src/dataset/partition.rs

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, RuntimeError};

/// Number of samples each rank draws per epoch.
///
/// Equal on every rank: `ceil(dataset_size / world_size)`.
pub fn samples_per_rank(dataset_size: usize, world_size: usize) -> usize {
    if world_size == 0 {
        return 0;
    }
    dataset_size.div_ceil(world_size)
}

/// Length of the permutation after padding it to a multiple of the world size.
pub fn padded_len(dataset_size: usize, world_size: usize) -> usize {
    samples_per_rank(dataset_size, world_size) * world_size
}

/// Compute the sample indices one rank visits in one epoch.
///
/// All ranks derive the same permutation of `0..dataset_size` from
/// `base_seed + epoch`, pad it cyclically from its start to a multiple of
/// `world_size`, and take the contiguous block at position `rank`. No
/// communication is needed to agree on the partition.
///
/// # Arguments
///
/// * `dataset_size` - Number of samples in the shared dataset
/// * `epoch` - Epoch number, mixed into the seed so each epoch reshuffles
/// * `rank` - The rank requesting its shard
/// * `world_size` - Number of ranks
/// * `base_seed` - Seed shared by every rank
///
/// # Errors
///
/// Returns `Configuration` if `world_size` is zero or `rank >= world_size`.
pub fn shard_for(
    dataset_size: usize,
    epoch: u64,
    rank: usize,
    world_size: usize,
    base_seed: u64,
) -> Result<Vec<usize>> {
    if world_size == 0 {
        return Err(RuntimeError::configuration(
            "cannot partition a dataset across zero ranks",
        ));
    }
    if rank >= world_size {
        return Err(RuntimeError::configuration(format!(
            "rank {rank} is out of range for world size {world_size}"
        )));
    }

    if dataset_size == 0 {
        return Ok(Vec::new());
    }

    let mut permutation: Vec<usize> = (0..dataset_size).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(epoch));
    permutation.shuffle(&mut rng);

    let per_rank = samples_per_rank(dataset_size, world_size);
    let start = rank * per_rank;

    // Positions past the end wrap to the start of the permutation
    Ok((start..start + per_rank)
        .map(|pos| permutation[pos % dataset_size])
        .collect())
}

/// One rank's shard for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochShard {
    pub epoch: u64,
    pub rank: usize,
    pub indices: Vec<usize>,
}

impl EpochShard {
    pub fn new(
        dataset_size: usize,
        epoch: u64,
        rank: usize,
        world_size: usize,
        base_seed: u64,
    ) -> Result<Self> {
        Ok(Self {
            epoch,
            rank,
            indices: shard_for(dataset_size, epoch, rank, world_size, base_seed)?,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Ordered batches of indices; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'_, usize> {
        self.indices.chunks(batch_size.max(1))
    }

    /// Number of local steps in the epoch. Identical on every rank.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.indices.len().div_ceil(batch_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_shards(d: usize, epoch: u64, w: usize, seed: u64) -> Vec<Vec<usize>> {
        (0..w).map(|r| shard_for(d, epoch, r, w, seed).unwrap()).collect()
    }

    #[test]
    fn test_shards_cover_dataset_exactly_when_divisible() {
        let shards = all_shards(100, 0, 4, 7);

        let mut seen = HashSet::new();
        for shard in &shards {
            assert_eq!(shard.len(), 25);
            for &i in shard {
                // No index appears twice across ranks
                assert!(seen.insert(i));
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_padding_repeats_from_permutation_start() {
        let (d, w) = (10, 4);
        let shards = all_shards(d, 3, w, 0);

        assert_eq!(samples_per_rank(d, w), 3);
        assert_eq!(padded_len(d, w), 12);
        assert!(shards.iter().all(|s| s.len() == 3));

        let flat: Vec<usize> = shards.concat();
        let covered: HashSet<usize> = flat.iter().copied().collect();
        assert_eq!(covered.len(), d);
        // The two padded positions repeat the first two of the permutation
        assert_eq!(flat[10], flat[0]);
        assert_eq!(flat[11], flat[1]);
    }

    #[test]
    fn test_more_ranks_than_samples() {
        let shards = all_shards(2, 0, 5, 1);
        assert!(shards.iter().all(|s| s.len() == 1));
        let covered: HashSet<usize> = shards.concat().into_iter().collect();
        assert_eq!(covered, HashSet::from([0, 1]));
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        assert_eq!(
            shard_for(1000, 4, 2, 3, 99).unwrap(),
            shard_for(1000, 4, 2, 3, 99).unwrap()
        );
    }

    #[test]
    fn test_epochs_reshuffle() {
        let a = shard_for(1000, 0, 0, 2, 5).unwrap();
        let b = shard_for(1000, 1, 0, 2, 5).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_single_rank_gets_a_permutation() {
        let shard = shard_for(50, 0, 0, 1, 0).unwrap();
        let mut sorted = shard.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_dataset() {
        assert!(shard_for(0, 0, 1, 2, 0).unwrap().is_empty());
        assert_eq!(padded_len(0, 3), 0);
    }

    #[test]
    fn test_invalid_rank_or_world() {
        assert!(matches!(
            shard_for(10, 0, 0, 0, 0),
            Err(RuntimeError::Configuration { .. })
        ));
        assert!(matches!(
            shard_for(10, 0, 2, 2, 0),
            Err(RuntimeError::Configuration { .. })
        ));
    }

    #[test]
    fn test_epoch_shard_batches() {
        let shard = EpochShard::new(10_000, 0, 1, 3, 0).unwrap();
        assert_eq!(shard.len(), 3334);
        assert_eq!(shard.num_batches(32), 105);

        let batches: Vec<&[usize]> = shard.batches(32).collect();
        assert_eq!(batches.len(), 105);
        assert_eq!(batches[104].len(), 3334 - 104 * 32);
        assert_eq!(batches.concat(), shard.indices);
    }
}
