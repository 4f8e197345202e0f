use bytemuck::Pod;
use tessera_core::sha256;
use thiserror::Error;
use tracing::warn;

use crate::{CollectiveError, Collectives, ProcessGroup};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{what} differs across {group}: ranks {mismatched_ranks:?} disagree with rank 0")]
pub struct SynchronizationError {
    pub what: String,
    pub group: String,
    pub mismatched_ranks: Vec<usize>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncCheckError {
    #[error("sync check collective failed: {0}")]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Unsynchronized(#[from] SynchronizationError),
}

/// Checks that every member of `pg` holds the same `bytes`.
///
/// Only digests travel over the group: rank 0 compares them and broadcasts the
/// ranks that disagree, so every member reaches the same verdict.
pub fn verify_synced_across_pg(
    pg: &dyn ProcessGroup,
    what: &str,
    bytes: &[u8],
) -> Result<(), SyncCheckError> {
    if pg.size() == 1 {
        return Ok(());
    }

    let digests = pg.all_gather_bytes(&sha256(bytes))?;
    let local_verdict: Vec<u64> = if pg.rank() == 0 {
        digests
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, digest)| *digest != &digests[0])
            .map(|(rank, _)| rank as u64)
            .collect()
    } else {
        Vec::new()
    };
    let mismatched_ranks: Vec<usize> = pg
        .broadcast_pod(0, &local_verdict)?
        .into_iter()
        .map(|rank| rank as usize)
        .collect();

    if mismatched_ranks.is_empty() {
        return Ok(());
    }

    if pg.rank() == 0 {
        warn!(
            what,
            group = pg.name(),
            expected = hex::encode(&digests[0]),
            ?mismatched_ranks,
            "Values are not synchronized"
        );
    }
    Err(SynchronizationError {
        what: what.to_owned(),
        group: pg.name().to_owned(),
        mismatched_ranks,
    }
    .into())
}

pub fn verify_values_synced_across_pg<T: Pod>(
    pg: &dyn ProcessGroup,
    what: &str,
    values: &[T],
) -> Result<(), SyncCheckError> {
    verify_synced_across_pg(pg, what, bytemuck::cast_slice(values))
}

/// Runs `f` on rank 0 of `pg` before every other rank.
///
/// Useful when rank 0 writes a cache that the rest then read.
pub fn main_rank_first<R>(
    pg: &dyn ProcessGroup,
    f: impl FnOnce() -> R,
) -> Result<R, CollectiveError> {
    if pg.rank() == 0 {
        let result = f();
        pg.barrier()?;
        Ok(result)
    } else {
        pg.barrier()?;
        Ok(f())
    }
}
