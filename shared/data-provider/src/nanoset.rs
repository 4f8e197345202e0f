use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::{RandomSeed, TokenSize};
use tessera_parallel::{main_rank_first, verify_synced_across_pg, ParallelContext, ProcessGroup};
use tracing::info;

use crate::{
    error::{config_error, NanosetError},
    BlendStrategy, SampleIndex, SampleIndexBuilder, TokenShard, Weighting,
};

/// Everything about the index except where the tokens live.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub sequence_length: usize,
    pub train_split_num_samples: usize,
    pub random_seed: RandomSeed,
    #[serde(default)]
    pub blend: BlendStrategy,
    #[serde(default)]
    pub max_epochs: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NanosetConfig {
    pub dataset_paths: Vec<PathBuf>,
    #[serde(default)]
    pub dataset_weights: Option<Vec<f64>>,
    #[serde(default)]
    pub token_size: TokenSize,
    #[serde(flatten)]
    pub sampling: SamplingConfig,
}

/// A fixed-length, randomly addressable view over one or more blended shards.
///
/// Sample `i` is read from shard `dataset_index[i]` at offset
/// `dataset_sample_index[i]`. The view never changes after construction; a new
/// weighting produces a new view over the same shards.
#[derive(Debug, Clone)]
pub struct Nanoset {
    shards: Arc<[TokenShard]>,
    sampling: SamplingConfig,
    dataset_lengths: Vec<usize>,
    index: SampleIndex,
}

impl Nanoset {
    pub fn new(config: NanosetConfig) -> Result<Self, NanosetError> {
        if config.dataset_paths.is_empty() {
            return Err(config_error!("at least one dataset path is required"));
        }
        let shards = config
            .dataset_paths
            .iter()
            .map(|path| TokenShard::open(path, config.token_size))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_shards(shards, config.dataset_weights.into(), config.sampling)
    }

    pub fn from_shards(
        shards: Vec<TokenShard>,
        weighting: Weighting,
        sampling: SamplingConfig,
    ) -> Result<Self, NanosetError> {
        Self::build(shards.into(), weighting, sampling)
    }

    fn build(
        shards: Arc<[TokenShard]>,
        weighting: Weighting,
        sampling: SamplingConfig,
    ) -> Result<Self, NanosetError> {
        if sampling.sequence_length == 0 {
            return Err(config_error!("sequence_length must be positive"));
        }
        let dataset_lengths: Vec<usize> = shards
            .iter()
            .map(|shard| shard.num_samples(sampling.sequence_length))
            .collect();

        let index = SampleIndexBuilder {
            dataset_lengths: dataset_lengths.clone(),
            weighting,
            train_split_num_samples: sampling.train_split_num_samples,
            random_seed: sampling.random_seed,
            blend: sampling.blend,
            max_epochs: sampling.max_epochs,
        }
        .build()?;

        let nanoset = Self {
            shards,
            sampling,
            dataset_lengths,
            index,
        };
        for ((shard, share), weight) in nanoset
            .shards
            .iter()
            .zip(nanoset.dataset_share())
            .zip(&nanoset.index.dataset_weights)
        {
            info!(
                path = %shard.path().display(),
                weight,
                share_percent = share * 100.0,
                "Dataset share of the index"
            );
        }
        Ok(nanoset)
    }

    /// Builds on rank 0 of the world group first, then checks every rank got
    /// the same index.
    pub fn build_synced(
        config: NanosetConfig,
        parallel_context: &ParallelContext,
    ) -> Result<Self, NanosetError> {
        let world_pg = parallel_context.world_pg.as_ref();
        let nanoset = main_rank_first(world_pg, || Self::new(config.clone()))??;
        nanoset.verify_synced(world_pg)?;
        Ok(nanoset)
    }

    /// Rebuilds the index over the same shards with new dataset weights.
    pub fn reweighted(
        &self,
        weighting: Weighting,
        random_seed: RandomSeed,
    ) -> Result<Self, NanosetError> {
        let sampling = SamplingConfig {
            random_seed,
            ..self.sampling.clone()
        };
        Self::build(self.shards.clone(), weighting, sampling)
    }

    pub fn len(&self) -> usize {
        self.index.dataset_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Result<Vec<u32>, NanosetError> {
        let dataset = self.domain_of(i)?;
        let sample = self.index.dataset_sample_index[i] as usize;
        self.shards[dataset].read_sample(sample, self.sampling.sequence_length)
    }

    /// Dataset id of sample `i`.
    pub fn domain_of(&self, i: usize) -> Result<usize, NanosetError> {
        self.index
            .dataset_index
            .get(i)
            .map(|&dataset| dataset as usize)
            .ok_or(NanosetError::Index {
                index: i,
                len: self.len(),
            })
    }

    pub fn num_datasets(&self) -> usize {
        self.shards.len()
    }

    pub fn sequence_length(&self) -> usize {
        self.sampling.sequence_length
    }

    pub fn random_seed(&self) -> RandomSeed {
        self.sampling.random_seed
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn shards(&self) -> &[TokenShard] {
        &self.shards
    }

    pub fn dataset_lengths(&self) -> &[usize] {
        &self.dataset_lengths
    }

    pub fn dataset_weights(&self) -> &[f64] {
        &self.index.dataset_weights
    }

    pub fn dataset_index(&self) -> &[u16] {
        &self.index.dataset_index
    }

    pub fn dataset_sample_index(&self) -> &[u64] {
        &self.index.dataset_sample_index
    }

    /// Realized fraction of the index drawn from each dataset.
    pub fn dataset_share(&self) -> Vec<f64> {
        let mut counts = vec![0usize; self.num_datasets()];
        for &dataset in &self.index.dataset_index {
            counts[dataset as usize] += 1;
        }
        counts
            .into_iter()
            .map(|count| count as f64 / self.len() as f64)
            .collect()
    }

    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.sampling.sequence_length as u64).to_le_bytes());
        for &length in &self.dataset_lengths {
            hasher.update((length as u64).to_le_bytes());
        }
        hasher.update(bytemuck::cast_slice::<u16, u8>(&self.index.dataset_index));
        hasher.update(bytemuck::cast_slice::<u64, u8>(&self.index.dataset_sample_index));
        hasher.finalize().into()
    }

    pub fn verify_synced(&self, pg: &dyn ProcessGroup) -> Result<(), NanosetError> {
        verify_synced_across_pg(pg, "nanoset index", &self.content_hash())?;
        Ok(())
    }
}
