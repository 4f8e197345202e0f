use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ProcessGroup, SingleProcessGroup};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParallelismError {
    #[error("{which} degree must be at least 1")]
    ZeroDegree { which: &'static str },

    #[error("{group} has {actual} ranks, expected {expected}")]
    GroupSizeMismatch {
        group: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn one() -> usize {
    1
}

/// Degrees of tensor, data and pipeline parallelism.
///
/// Ranks are laid out with tensor-parallel peers adjacent, then data-parallel
/// replicas, then pipeline stages:
/// `world_rank = pp_rank * dp * tp + dp_rank * tp + tp_rank`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParallelismConfig {
    #[serde(default = "one")]
    pub tp: usize,
    #[serde(default = "one")]
    pub dp: usize,
    #[serde(default = "one")]
    pub pp: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl ParallelismConfig {
    pub const fn new(tp: usize, dp: usize, pp: usize) -> Self {
        Self { tp, dp, pp }
    }

    pub fn validate(&self) -> Result<(), ParallelismError> {
        for (which, degree) in [("tp", self.tp), ("dp", self.dp), ("pp", self.pp)] {
            if degree == 0 {
                return Err(ParallelismError::ZeroDegree { which });
            }
        }
        Ok(())
    }

    pub fn world_size(&self) -> usize {
        self.tp * self.dp * self.pp
    }

    /// Returns `(pp_rank, dp_rank, tp_rank)` for a world rank.
    pub fn coordinates(&self, world_rank: usize) -> (usize, usize, usize) {
        let pp_rank = world_rank / (self.dp * self.tp);
        let dp_rank = (world_rank / self.tp) % self.dp;
        let tp_rank = world_rank % self.tp;
        (pp_rank, dp_rank, tp_rank)
    }

    pub fn world_rank(&self, pp_rank: usize, dp_rank: usize, tp_rank: usize) -> usize {
        pp_rank * self.dp * self.tp + dp_rank * self.tp + tp_rank
    }

    /// Every `(tp, dp, pp)` whose product is `world_size`.
    pub fn all_3d_configurations(world_size: usize) -> Vec<Self> {
        let mut configs = Vec::new();
        for tp in 1..=world_size {
            if world_size % tp != 0 {
                continue;
            }
            let rest = world_size / tp;
            for dp in 1..=rest {
                if rest % dp == 0 {
                    configs.push(Self::new(tp, dp, rest / dp));
                }
            }
        }
        configs
    }
}

/// The process groups one rank participates in.
#[derive(Debug, Clone)]
pub struct ParallelContext {
    config: ParallelismConfig,
    pub world_pg: Arc<dyn ProcessGroup>,
    pub tp_pg: Arc<dyn ProcessGroup>,
    pub dp_pg: Arc<dyn ProcessGroup>,
    pub pp_pg: Arc<dyn ProcessGroup>,
}

impl ParallelContext {
    /// A context for a single process with no parallelism.
    pub fn single() -> Self {
        Self {
            config: ParallelismConfig::default(),
            world_pg: Arc::new(SingleProcessGroup::new("world_pg")),
            tp_pg: Arc::new(SingleProcessGroup::new("tp_pg")),
            dp_pg: Arc::new(SingleProcessGroup::new("dp_pg")),
            pp_pg: Arc::new(SingleProcessGroup::new("pp_pg")),
        }
    }

    pub fn from_groups(
        config: ParallelismConfig,
        world_pg: Arc<dyn ProcessGroup>,
        tp_pg: Arc<dyn ProcessGroup>,
        dp_pg: Arc<dyn ProcessGroup>,
        pp_pg: Arc<dyn ProcessGroup>,
    ) -> Result<Self, ParallelismError> {
        config.validate()?;
        for (group, expected, pg) in [
            ("world_pg", config.world_size(), &world_pg),
            ("tp_pg", config.tp, &tp_pg),
            ("dp_pg", config.dp, &dp_pg),
            ("pp_pg", config.pp, &pp_pg),
        ] {
            if pg.size() != expected {
                return Err(ParallelismError::GroupSizeMismatch {
                    group,
                    expected,
                    actual: pg.size(),
                });
            }
        }
        Ok(Self {
            config,
            world_pg,
            tp_pg,
            dp_pg,
            pp_pg,
        })
    }

    pub fn config(&self) -> ParallelismConfig {
        self.config
    }

    pub fn tensor_parallel_size(&self) -> usize {
        self.config.tp
    }

    pub fn data_parallel_size(&self) -> usize {
        self.config.dp
    }

    pub fn pipeline_parallel_size(&self) -> usize {
        self.config.pp
    }

    pub fn world_rank(&self) -> usize {
        self.world_pg.rank()
    }

    pub fn tp_rank(&self) -> usize {
        self.tp_pg.rank()
    }

    pub fn dp_rank(&self) -> usize {
        self.dp_pg.rank()
    }

    pub fn pp_rank(&self) -> usize {
        self.pp_pg.rank()
    }
}
