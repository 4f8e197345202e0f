use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tessera_core::{RandomSeed, TokenSize};
use tessera_data_provider::{
    build_nanoset_dataloader, write_index_sidecar, write_token_shard, Nanoset,
};
use tessera_doremi::{DoReMiContext, WeightUpdater};
use tessera_parallel::{LocalCluster, ParallelismConfig};
use tessera_telemetry::{logging, LogOutput};
use tracing::info;

mod config;

use config::RunConfig;

#[derive(Parser, Debug)]
#[command(name = "nanoset-tool")]
#[command(about = "Build, inspect and reweight blended token datasets")]
struct Args {
    /// Log output: console for standard logs, json for one JSON object per line
    #[clap(
        long,
        env,
        global = true,
        default_value_t = LogOutput::Console,
        value_enum,
        ignore_case = true
    )]
    logs: LogOutput,

    /// Also append logs to this file, filtered by WRITE_RUST_LOG when set
    #[clap(long, env, global = true)]
    write_log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the sample index of a run config and print its hash and dataset shares
    BuildIndex {
        #[arg(long, env = "TESSERA_CONFIG")]
        config: PathBuf,
    },

    /// Print the first micro-batches every data-parallel rank would load
    InspectBatch {
        #[arg(long, env = "TESSERA_CONFIG")]
        config: PathBuf,

        #[arg(long, default_value_t = 1)]
        data_parallelism: usize,

        /// Only print this data-parallel rank
        #[arg(long)]
        dp_rank: Option<usize>,

        /// Resume point, overriding the config's consumed_train_samples
        #[arg(long)]
        consumed_samples: Option<usize>,

        #[arg(long, default_value_t = 1)]
        num_batches: usize,
    },

    /// Apply one domain weight update and print the reweighted index shares
    UpdateWeights {
        #[arg(long, env = "TESSERA_CONFIG")]
        config: PathBuf,

        /// Comma-separated excess loss of each domain
        #[arg(long, value_delimiter = ',', required = true)]
        domain_losses: Vec<f32>,
    },

    /// Write a shard of random tokens, for tests and benchmarks
    WriteDummyShard {
        #[arg(long)]
        output: PathBuf,

        #[arg(long)]
        num_tokens: usize,

        #[arg(long, default_value_t = 50_000)]
        vocab_size: u32,

        /// Bytes per token: 2 or 4
        #[arg(long, default_value = "2", value_parser = parse_token_size)]
        token_size: TokenSize,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Also write a Megatron .idx sidecar splitting the shard into this many documents
        #[arg(long)]
        num_documents: Option<usize>,
    },
}

fn parse_token_size(s: &str) -> Result<TokenSize, String> {
    let bytes: usize = s.parse().map_err(|e| format!("{e}"))?;
    TokenSize::try_from(bytes).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, PartialEq)]
struct IndexSummary {
    hash: String,
    num_samples: usize,
    dataset_lengths: Vec<usize>,
    dataset_weights: Vec<f64>,
    dataset_share: Vec<f64>,
}

impl IndexSummary {
    fn of(nanoset: &Nanoset) -> Self {
        Self {
            hash: hex::encode(nanoset.content_hash()),
            num_samples: nanoset.len(),
            dataset_lengths: nanoset.dataset_lengths().to_vec(),
            dataset_weights: nanoset.dataset_weights().to_vec(),
            dataset_share: nanoset.dataset_share(),
        }
    }

    fn print(&self, paths: &[PathBuf]) {
        println!("index hash: {}", self.hash);
        println!("samples:    {}", self.num_samples);
        for (dataset, path) in paths.iter().enumerate() {
            println!(
                "  [{dataset}] {}: {} samples, weight {:.4}, share {:.2}%",
                path.display(),
                self.dataset_lengths[dataset],
                self.dataset_weights[dataset],
                self.dataset_share[dataset] * 100.0
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct BatchSummary {
    dp_rank: usize,
    start: u64,
    end: u64,
    rows: usize,
    hash: String,
    domains: Vec<u16>,
}

fn build_index(config: &RunConfig) -> Result<IndexSummary> {
    let nanoset = Nanoset::new(config.data.nanoset.clone())?;
    Ok(IndexSummary::of(&nanoset))
}

fn inspect_batches(
    config: &RunConfig,
    data_parallelism: usize,
    consumed_samples: Option<usize>,
    num_batches: usize,
) -> Result<Vec<BatchSummary>> {
    let nanoset = Arc::new(Nanoset::new(config.data.nanoset.clone())?);
    let cluster = LocalCluster::new(ParallelismConfig::new(1, data_parallelism, 1))?;
    let per_rank = cluster.run(|context| {
        nanoset.verify_synced(context.world_pg.as_ref())?;
        let dataloader = build_nanoset_dataloader(
            nanoset.clone(),
            &context,
            config.dataloader_config(consumed_samples),
        )?;
        dataloader
            .take(num_batches)
            .map(|batch| -> Result<BatchSummary> {
                let batch = batch?;
                Ok(BatchSummary {
                    dp_rank: context.dp_rank(),
                    start: batch.range.start,
                    end: batch.range.end,
                    rows: batch.num_rows(),
                    hash: hex::encode(batch.content_hash()),
                    domains: batch.domain_idxs.local().unwrap_or_default().to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()
    })?;
    Ok(per_rank.into_iter().flatten().collect())
}

fn update_weights(config: &RunConfig, domain_losses: &[f32]) -> Result<(Vec<f32>, IndexSummary)> {
    let doremi_config = config
        .doremi
        .clone()
        .context("the config has no [doremi] section")?;
    let mut context = DoReMiContext::from_config(doremi_config, true)?;
    if context.num_domains() != config.data.nanoset.dataset_paths.len() {
        bail!(
            "{} domains configured for {} datasets",
            context.num_domains(),
            config.data.nanoset.dataset_paths.len()
        );
    }
    let nanoset = Nanoset::new(config.data.nanoset.clone())?;
    let weights = WeightUpdater::step(&mut context, domain_losses)?;
    let reweighted = nanoset.reweighted(context.dataset_weighting(), nanoset.random_seed())?;
    Ok((weights, IndexSummary::of(&reweighted)))
}

fn write_dummy_shard(
    output: &Path,
    num_tokens: usize,
    vocab_size: u32,
    token_size: TokenSize,
    seed: u64,
    num_documents: Option<usize>,
) -> Result<()> {
    if vocab_size == 0 || vocab_size - 1 > token_size.max_token() {
        bail!(
            "vocab size {vocab_size} does not fit in {} bytes",
            usize::from(token_size)
        );
    }
    let mut rng = RandomSeed::new(seed).stream("dummy-shard", &[]);
    let tokens: Vec<u32> = (0..num_tokens)
        .map(|_| rng.random_range(0..vocab_size))
        .collect();
    write_token_shard(output, &tokens, token_size)?;

    if let Some(num_documents) = num_documents {
        if num_documents == 0 || num_documents > num_tokens {
            bail!("cannot split {num_tokens} tokens into {num_documents} documents");
        }
        let base = num_tokens / num_documents;
        let lengths: Vec<u32> = (0..num_documents)
            .map(|doc| {
                let extra = usize::from(doc < num_tokens % num_documents);
                (base + extra) as u32
            })
            .collect();
        let idx_path = write_index_sidecar(output, &lengths, token_size)?;
        info!(path = %idx_path.display(), num_documents, "Wrote index sidecar");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    logging()
        .with_output(args.logs)
        .with_log_file(args.write_log_file.clone())
        .init()?;

    match args.command {
        Commands::BuildIndex { config } => {
            let run_config = RunConfig::load(&config)?;
            build_index(&run_config)?.print(&run_config.data.nanoset.dataset_paths);
        }
        Commands::InspectBatch {
            config,
            data_parallelism,
            dp_rank,
            consumed_samples,
            num_batches,
        } => {
            let run_config = RunConfig::load(&config)?;
            let batches =
                inspect_batches(&run_config, data_parallelism, consumed_samples, num_batches)?;
            for batch in batches
                .iter()
                .filter(|batch| dp_rank.is_none_or(|rank| rank == batch.dp_rank))
            {
                println!(
                    "dp {}/{data_parallelism} samples [{}, {}) rows {} hash {} domains {:?}",
                    batch.dp_rank, batch.start, batch.end, batch.rows, batch.hash, batch.domains
                );
            }
        }
        Commands::UpdateWeights {
            config,
            domain_losses,
        } => {
            let run_config = RunConfig::load(&config)?;
            let (weights, summary) = update_weights(&run_config, &domain_losses)?;
            println!("domain weights: {weights:?}");
            summary.print(&run_config.data.nanoset.dataset_paths);
        }
        Commands::WriteDummyShard {
            output,
            num_tokens,
            vocab_size,
            token_size,
            seed,
            num_documents,
        } => {
            write_dummy_shard(
                &output,
                num_tokens,
                vocab_size,
                token_size,
                seed,
                num_documents,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run_config(dir: &tempfile::TempDir, weights: &str, doremi: bool) -> RunConfig {
        let web = dir.path().join("web.bin");
        let code = dir.path().join("code.bin");
        write_dummy_shard(&web, 8_000, 1_000, TokenSize::TwoBytes, 1, Some(4)).unwrap();
        write_dummy_shard(&code, 4_000, 1_000, TokenSize::TwoBytes, 2, None).unwrap();
        let doremi = if doremi {
            "[doremi]\ndomain_keys = [\"web\", \"code\"]\n"
        } else {
            ""
        };
        let contents = format!(
            r#"
[data]
dataset_paths = [{web:?}, {code:?}]
dataset_weights = {weights}
sequence_length = 16
train_split_num_samples = 200
random_seed = 7

[dataloader]
micro_batch_size = 2

{doremi}"#
        );
        let path = dir.path().join("run.toml");
        std::fs::write(&path, contents).unwrap();
        RunConfig::load(&path).unwrap()
    }

    #[test]
    fn build_index_reports_exact_shares() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(&dir, "[3.0, 1.0]", false);
        let summary = build_index(&config).unwrap();

        assert_eq!(summary.num_samples, 200);
        assert_eq!(summary.dataset_lengths, vec![499, 249]);
        assert_eq!(summary.dataset_weights, vec![0.75, 0.25]);
        assert_eq!(summary.dataset_share, vec![0.75, 0.25]);
        assert_eq!(summary, build_index(&config).unwrap());
    }

    #[test]
    fn inspect_batches_splits_the_global_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(&dir, "[1.0, 1.0]", false);
        let batches = inspect_batches(&config, 2, Some(8), 2).unwrap();

        let ranges: Vec<_> = batches
            .iter()
            .map(|b| (b.dp_rank, b.start, b.end, b.rows))
            .collect();
        assert_eq!(
            ranges,
            vec![(0, 8, 10, 2), (0, 12, 14, 2), (1, 10, 12, 2), (1, 14, 16, 2)]
        );
        assert!(batches.iter().all(|b| b.domains.len() == 2));
    }

    #[test]
    fn update_weights_feeds_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(&dir, "[1.0, 1.0]", true);
        let (weights, summary) = update_weights(&config, &[0.1, 2.0]).unwrap();

        assert!(weights[1] > weights[0]);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(summary.dataset_share[1] > summary.dataset_share[0]);
        assert!(update_weights(&config, &[0.1]).is_err());
    }

    #[test]
    fn update_weights_needs_doremi_section() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(&dir, "[1.0, 1.0]", false);
        assert!(update_weights(&config, &[0.1, 0.2]).is_err());
    }

    #[test]
    fn dummy_shard_with_sidecar_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.bin");
        write_dummy_shard(&path, 1_001, 70_000, TokenSize::FourBytes, 3, Some(3)).unwrap();

        let shard = tessera_data_provider::TokenShard::open(&path, TokenSize::FourBytes).unwrap();
        assert_eq!(shard.num_tokens(), 1_001);
        assert_eq!(shard.num_documents(), Some(3));
        assert!(write_dummy_shard(&path, 10, 70_000, TokenSize::TwoBytes, 3, None).is_err());
        assert!(write_dummy_shard(&path, 10, 100, TokenSize::TwoBytes, 3, Some(11)).is_err());
    }

    #[test]
    fn token_size_parser() {
        assert_eq!(parse_token_size("4"), Ok(TokenSize::FourBytes));
        assert!(parse_token_size("3").is_err());
        assert!(parse_token_size("two").is_err());
    }
}
