mod dataloader;
mod error;
mod index_builder;
mod nanoset;
mod sampler;
mod shard;
mod weighting;

pub use dataloader::{
    build_nanoset_dataloader, Batch, BatchField, DataCollatorForCLM, DataLoaderConfig,
    NanosetDataLoader,
};
pub use error::NanosetError;
pub use index_builder::{
    epoch_permutation, BlendStrategy, SampleIndex, SampleIndexBuilder, MAX_DATASETS,
};
pub use nanoset::{Nanoset, NanosetConfig, SamplingConfig};
pub use sampler::ResumableBatchSampler;
pub use shard::{write_index_sidecar, write_token_shard, DataFormat, IndexSidecar, TokenShard};
pub use weighting::Weighting;
