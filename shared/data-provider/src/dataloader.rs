use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::SampleRange;
use tessera_parallel::ParallelContext;
use tracing::{debug, info};

use crate::{
    error::{config_error, NanosetError},
    Nanoset, ResumableBatchSampler,
};

/// One field of a micro-batch.
///
/// Pipeline ranks that neither feed the model nor compute the loss never
/// materialize data; they hold a pointer to the pipeline rank that does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchField<T> {
    Local { shape: Vec<usize>, data: Vec<T> },
    Remote { group_rank: usize },
}

impl<T> BatchField<T> {
    pub fn local(&self) -> Option<&[T]> {
        match self {
            BatchField::Local { data, .. } => Some(data),
            BatchField::Remote { .. } => None,
        }
    }

    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            BatchField::Local { shape, .. } => Some(shape),
            BatchField::Remote { .. } => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, BatchField::Local { .. })
    }
}

/// A micro-batch of `[rows, sequence_length]` token ids and masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub range: SampleRange,
    pub input_ids: BatchField<u32>,
    pub input_mask: BatchField<bool>,
    pub label_ids: BatchField<u32>,
    pub label_mask: BatchField<bool>,
    pub domain_idxs: BatchField<u16>,
}

impl Batch {
    pub fn num_rows(&self) -> usize {
        self.range.len() as usize
    }

    /// Hash over every field this rank holds locally.
    pub fn content_hash(&self) -> [u8; 32] {
        fn field<T>(
            hasher: &mut Sha256,
            name: &str,
            field: &BatchField<T>,
            encode: impl Fn(&T) -> Vec<u8>,
        ) {
            hasher.update(name.as_bytes());
            match field {
                BatchField::Local { shape, data } => {
                    for dim in shape {
                        hasher.update((*dim as u64).to_le_bytes());
                    }
                    for value in data {
                        hasher.update(encode(value));
                    }
                }
                BatchField::Remote { group_rank } => {
                    hasher.update(b"remote");
                    hasher.update((*group_rank as u64).to_le_bytes());
                }
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(self.range.start.to_le_bytes());
        hasher.update(self.range.end.to_le_bytes());
        field(&mut hasher, "input_ids", &self.input_ids, |t| t.to_le_bytes().to_vec());
        field(&mut hasher, "input_mask", &self.input_mask, |m| vec![*m as u8]);
        field(&mut hasher, "label_ids", &self.label_ids, |t| t.to_le_bytes().to_vec());
        field(&mut hasher, "label_mask", &self.label_mask, |m| vec![*m as u8]);
        field(&mut hasher, "domain_idxs", &self.domain_idxs, |d| d.to_le_bytes().to_vec());
        hasher.finalize().into()
    }
}

/// Shifts rows of `sequence_length + 1` tokens into next-token inputs and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCollatorForCLM {
    pub sequence_length: usize,
    pub input_pp_rank: usize,
    pub output_pp_rank: usize,
    pub pp_rank: usize,
}

impl DataCollatorForCLM {
    /// Whether this pipeline rank reads samples at all.
    pub fn needs_data(&self) -> bool {
        self.pp_rank == self.input_pp_rank || self.pp_rank == self.output_pp_rank
    }

    pub fn collate(
        &self,
        range: SampleRange,
        rows: Vec<(Vec<u32>, u16)>,
    ) -> Result<Batch, NanosetError> {
        fn remote<T>(group_rank: usize) -> BatchField<T> {
            BatchField::Remote { group_rank }
        }
        let (input_pp_rank, output_pp_rank) = (self.input_pp_rank, self.output_pp_rank);
        if !self.needs_data() {
            return Ok(Batch {
                range,
                input_ids: remote(input_pp_rank),
                input_mask: remote(input_pp_rank),
                label_ids: remote(output_pp_rank),
                label_mask: remote(output_pp_rank),
                domain_idxs: remote(output_pp_rank),
            });
        }

        let width = self.sequence_length + 1;
        if let Some((row, (tokens, _))) = rows
            .iter()
            .enumerate()
            .find(|(_, (tokens, _))| tokens.len() != width)
        {
            return Err(config_error!(
                "row {row} holds {} tokens, expected sequence_length + 1 = {width}",
                tokens.len()
            ));
        }

        let shape = vec![rows.len(), self.sequence_length];
        let mask = || BatchField::Local {
            shape: shape.clone(),
            data: vec![true; rows.len() * self.sequence_length],
        };
        let shifted = |skip: usize| BatchField::Local {
            shape: shape.clone(),
            data: rows
                .iter()
                .flat_map(|(tokens, _)| tokens[skip..skip + self.sequence_length].iter().copied())
                .collect(),
        };

        let (input_ids, input_mask) = if self.pp_rank == self.input_pp_rank {
            (shifted(0), mask())
        } else {
            (remote(input_pp_rank), remote(input_pp_rank))
        };
        let (label_ids, label_mask, domain_idxs) = if self.pp_rank == self.output_pp_rank {
            (
                shifted(1),
                mask(),
                BatchField::Local {
                    shape: vec![rows.len()],
                    data: rows.iter().map(|(_, domain)| *domain).collect(),
                },
            )
        } else {
            (
                remote(output_pp_rank),
                remote(output_pp_rank),
                remote(output_pp_rank),
            )
        };

        Ok(Batch {
            range,
            input_ids,
            input_mask,
            label_ids,
            label_mask,
            domain_idxs,
        })
    }
}

fn default_drop_last() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataLoaderConfig {
    pub sequence_length: usize,
    #[serde(default)]
    pub input_pp_rank: usize,
    /// Defaults to the last pipeline stage when absent.
    #[serde(default)]
    pub output_pp_rank: Option<usize>,
    pub micro_batch_size: usize,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default = "default_drop_last")]
    pub drop_last: bool,
    #[serde(default)]
    pub consumed_train_samples: usize,
}

/// Iterates this rank's micro-batches of a [`Nanoset`].
pub struct NanosetDataLoader {
    dataset: Arc<Nanoset>,
    sampler: ResumableBatchSampler,
    collator: DataCollatorForCLM,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for NanosetDataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NanosetDataLoader")
            .field("sampler", &self.sampler)
            .field("collator", &self.collator)
            .field("workers", &self.pool.as_ref().map(|p| p.current_num_threads()))
            .finish()
    }
}

impl NanosetDataLoader {
    pub fn sampler(&self) -> &ResumableBatchSampler {
        &self.sampler
    }

    /// Global samples consumed by every rank together, for checkpointing.
    pub fn consumed_train_samples(&self) -> u64 {
        self.sampler.cursor()
    }

    fn read_rows(&self, range: SampleRange) -> Result<Vec<(Vec<u32>, u16)>, NanosetError> {
        let read = |i: u64| -> Result<(Vec<u32>, u16), NanosetError> {
            let i = i as usize;
            Ok((self.dataset.get(i)?, self.dataset.domain_of(i)? as u16))
        };
        match &self.pool {
            Some(pool) if range.len() > 1 => {
                pool.install(|| (range.start..range.end).into_par_iter().map(read).collect())
            }
            _ => range.iter().map(read).collect(),
        }
    }
}

impl Iterator for NanosetDataLoader {
    type Item = Result<Batch, NanosetError>;

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.sampler.next()?;
        let rows = if self.collator.needs_data() {
            match self.read_rows(range) {
                Ok(rows) => rows,
                Err(err) => return Some(Err(err)),
            }
        } else {
            Vec::new()
        };
        Some(self.collator.collate(range, rows))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.sampler.size_hint()
    }
}

pub fn build_nanoset_dataloader(
    dataset: Arc<Nanoset>,
    parallel_context: &ParallelContext,
    config: DataLoaderConfig,
) -> Result<NanosetDataLoader, NanosetError> {
    if config.sequence_length != dataset.sequence_length() {
        return Err(config_error!(
            "dataloader sequence_length {} differs from the dataset's {}",
            config.sequence_length,
            dataset.sequence_length()
        ));
    }
    let pp_size = parallel_context.pipeline_parallel_size();
    let output_pp_rank = config.output_pp_rank.unwrap_or(pp_size - 1);
    for (which, rank) in [("input", config.input_pp_rank), ("output", output_pp_rank)] {
        if rank >= pp_size {
            return Err(config_error!(
                "{which} pipeline rank {rank} is out of range for {pp_size} stages"
            ));
        }
    }

    let sampler = ResumableBatchSampler::new(
        dataset.len(),
        config.consumed_train_samples,
        config.micro_batch_size,
        parallel_context.dp_rank(),
        parallel_context.data_parallel_size(),
        config.drop_last,
    )?;
    let collator = DataCollatorForCLM {
        sequence_length: config.sequence_length,
        input_pp_rank: config.input_pp_rank,
        output_pp_rank,
        pp_rank: parallel_context.pp_rank(),
    };

    let pool = if config.num_workers > 0 && collator.needs_data() {
        Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("nanoset-loader-{i}"))
                .build()
                .map_err(|e| config_error!("failed to build dataloader thread pool: {e}"))?,
        )
    } else {
        None
    };

    if config.consumed_train_samples > 0 {
        info!(
            consumed_train_samples = config.consumed_train_samples,
            remaining_batches = sampler.remaining_batches(),
            "Resuming dataloader"
        );
    }
    debug!(
        world_rank = parallel_context.world_rank(),
        dp_rank = parallel_context.dp_rank(),
        pp_rank = parallel_context.pp_rank(),
        needs_data = collator.needs_data(),
        workers = config.num_workers,
        "Built nanoset dataloader"
    );

    Ok(NanosetDataLoader {
        dataset,
        sampler,
        collator,
        pool,
    })
}
