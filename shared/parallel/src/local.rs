use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    thread,
};

use anyhow::{anyhow, Result};
use tessera_core::{Barrier, CancellableBarrier};
use tracing::{debug, error};

use crate::{
    context::ParallelismError, CollectiveError, ParallelContext, ParallelismConfig, ProcessGroup,
};

/// Shared mailbox for one in-process group.
#[derive(Debug)]
struct Exchange {
    barrier: CancellableBarrier,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

impl Exchange {
    fn new(size: usize) -> Self {
        Self {
            barrier: CancellableBarrier::new(size),
            slots: Mutex::new(vec![None; size]),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<Option<Vec<u8>>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abort(&self) {
        self.barrier.cancel();
    }

    fn reset(&self) {
        self.barrier.reset();
        self.slots().iter_mut().for_each(|slot| *slot = None);
    }
}

/// A member of a group whose ranks are threads of the same process.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    name: String,
    rank: usize,
    exchange: Arc<Exchange>,
}

impl LocalProcessGroup {
    fn wait(&self) -> Result<(), CollectiveError> {
        self.exchange
            .barrier
            .wait()
            .map_err(|cancelled| CollectiveError::cancelled(&self.name, cancelled))
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.exchange.barrier.participants()
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.wait()
    }

    fn all_gather_bytes(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CollectiveError> {
        self.exchange.slots()[self.rank] = Some(local.to_vec());
        self.wait()?;

        let gathered = self
            .exchange
            .slots()
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone().ok_or_else(|| CollectiveError::MissingContribution {
                    group: self.name.clone(),
                    rank,
                })
            })
            .collect::<Result<Vec<_>, _>>();

        // nobody may overwrite a slot until every member has read it
        self.wait()?;
        gathered
    }

    fn abort(&self) {
        self.exchange.abort();
    }
}

/// Aborts every group of the cluster if a rank unwinds mid-collective.
struct AbortOnPanic<'a> {
    cluster: &'a LocalCluster,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.cluster.abort();
        }
    }
}

/// A full tp x dp x pp topology running as threads of one process.
///
/// Used to exercise the data pipeline and the loss under every parallel
/// layout without a real collective backend.
#[derive(Debug)]
pub struct LocalCluster {
    config: ParallelismConfig,
    contexts: Vec<ParallelContext>,
    exchanges: Vec<Arc<Exchange>>,
}

impl LocalCluster {
    pub fn new(config: ParallelismConfig) -> Result<Self, ParallelismError> {
        config.validate()?;
        let world = Arc::new(Exchange::new(config.world_size()));
        let mut exchanges = vec![world.clone()];
        let mut group_exchange = |groups: &mut BTreeMap<(usize, usize), Arc<Exchange>>,
                                  key: (usize, usize),
                                  size: usize| {
            groups
                .entry(key)
                .or_insert_with(|| {
                    let exchange = Arc::new(Exchange::new(size));
                    exchanges.push(exchange.clone());
                    exchange
                })
                .clone()
        };

        let mut tp_groups = BTreeMap::new();
        let mut dp_groups = BTreeMap::new();
        let mut pp_groups = BTreeMap::new();
        let mut contexts = Vec::with_capacity(config.world_size());
        for world_rank in 0..config.world_size() {
            let (pp_rank, dp_rank, tp_rank) = config.coordinates(world_rank);
            let member = |name: &str, rank: usize, exchange: Arc<Exchange>| {
                Arc::new(LocalProcessGroup {
                    name: name.to_owned(),
                    rank,
                    exchange,
                }) as Arc<dyn ProcessGroup>
            };
            let tp = group_exchange(&mut tp_groups, (pp_rank, dp_rank), config.tp);
            let dp = group_exchange(&mut dp_groups, (pp_rank, tp_rank), config.dp);
            let pp = group_exchange(&mut pp_groups, (dp_rank, tp_rank), config.pp);
            contexts.push(ParallelContext::from_groups(
                config,
                member("world_pg", world_rank, world.clone()),
                member("tp_pg", tp_rank, tp),
                member("dp_pg", dp_rank, dp),
                member("pp_pg", pp_rank, pp),
            )?);
        }

        debug!(
            tp = config.tp,
            dp = config.dp,
            pp = config.pp,
            groups = exchanges.len(),
            "Built local cluster"
        );
        Ok(Self {
            config,
            contexts,
            exchanges,
        })
    }

    pub fn config(&self) -> ParallelismConfig {
        self.config
    }

    /// Contexts indexed by world rank.
    pub fn contexts(&self) -> &[ParallelContext] {
        &self.contexts
    }

    /// Cancels every group so blocked ranks return [`CollectiveError::Cancelled`].
    pub fn abort(&self) {
        for exchange in &self.exchanges {
            exchange.abort();
        }
    }

    /// Runs `f` once per rank, each on its own thread, and returns the
    /// per-rank results indexed by world rank. A rank that fails or panics
    /// aborts the cluster so its peers cannot deadlock.
    pub fn run_all<F, T>(&self, f: F) -> Vec<Result<T>>
    where
        F: Fn(ParallelContext) -> Result<T> + Send + Sync,
        T: Send,
    {
        for exchange in &self.exchanges {
            exchange.reset();
        }

        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .contexts
                .iter()
                .cloned()
                .map(|context| {
                    scope.spawn(move || {
                        let _guard = AbortOnPanic { cluster: self };
                        let world_rank = context.world_rank();
                        let result = f(context);
                        if let Err(err) = &result {
                            error!(world_rank, "Rank failed: {err:#}");
                            self.abort();
                        }
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(world_rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("rank {world_rank} panicked")))
                })
                .collect()
        })
    }

    /// Like [`LocalCluster::run_all`], but fails with the root cause: the first
    /// error that is not a cancellation caused by another rank.
    pub fn run<F, T>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(ParallelContext) -> Result<T> + Send + Sync,
        T: Send,
    {
        let mut root_cause = None;
        let mut first_cancellation = None;
        let mut values = Vec::new();
        for (world_rank, result) in self.run_all(f).into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(err) => {
                    let err = err.context(format!("rank {world_rank} failed"));
                    if !is_cancellation(&err) {
                        root_cause.get_or_insert(err);
                    } else {
                        first_cancellation.get_or_insert(err);
                    }
                }
            }
        }
        match root_cause.or(first_cancellation) {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::Cancelled { .. })
        )
    })
}
