use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tessera_data_provider::{DataLoaderConfig, NanosetConfig};
use tessera_doremi::DoReMiConfig;

fn default_drop_last() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataSection {
    #[serde(flatten)]
    pub nanoset: NanosetConfig,
    /// Threads reading samples; zero reads on the calling thread.
    #[serde(default)]
    pub num_loading_workers: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataLoaderSection {
    pub micro_batch_size: usize,
    #[serde(default = "default_drop_last")]
    pub drop_last: bool,
    #[serde(default)]
    pub consumed_train_samples: usize,
    #[serde(default)]
    pub input_pp_rank: usize,
    #[serde(default)]
    pub output_pp_rank: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub data: DataSection,
    pub dataloader: DataLoaderSection,
    #[serde(default)]
    pub doremi: Option<DoReMiConfig>,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Dataloader settings, optionally resuming from `consumed_train_samples`.
    pub fn dataloader_config(&self, consumed_train_samples: Option<usize>) -> DataLoaderConfig {
        DataLoaderConfig {
            sequence_length: self.data.nanoset.sampling.sequence_length,
            input_pp_rank: self.dataloader.input_pp_rank,
            output_pp_rank: self.dataloader.output_pp_rank,
            micro_batch_size: self.dataloader.micro_batch_size,
            num_workers: self.data.num_loading_workers,
            drop_last: self.dataloader.drop_last,
            consumed_train_samples: consumed_train_samples
                .unwrap_or(self.dataloader.consumed_train_samples),
        }
    }
}
