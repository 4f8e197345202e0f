use std::fmt;

use bytemuck::Pod;
use tessera_core::CancelledBarrier;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollectiveError {
    #[error("collective on {group} was cancelled because a peer rank failed")]
    Cancelled { group: String },

    #[error("rank {rank} of {group} did not contribute to the collective")]
    MissingContribution { group: String, rank: usize },

    #[error("malformed payload on {group}: {reason}")]
    Malformed { group: String, reason: String },

    #[error("root rank {root} is out of range for {group} of size {size}")]
    InvalidRoot {
        group: String,
        root: usize,
        size: usize,
    },
}

impl CollectiveError {
    pub(crate) fn cancelled(group: &str, _: CancelledBarrier) -> Self {
        Self::Cancelled {
            group: group.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceType {
    Sum,
    Max,
    Mean,
}

/// A named group of ranks that can run blocking collectives together.
///
/// Every member must call the same collectives in the same order. Payloads are
/// exchanged as bytes; see [`Collectives`] for typed helpers.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Returns every member's payload, indexed by rank.
    fn all_gather_bytes(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CollectiveError>;

    /// Returns the root's payload on every rank. Non-root payloads are ignored.
    fn broadcast_bytes(&self, root: usize, local: &[u8]) -> Result<Vec<u8>, CollectiveError> {
        if root >= self.size() {
            return Err(CollectiveError::InvalidRoot {
                group: self.name().to_owned(),
                root,
                size: self.size(),
            });
        }
        let mut gathered = self.all_gather_bytes(local)?;
        Ok(gathered.swap_remove(root))
    }

    /// Fails every pending and future collective on this group.
    fn abort(&self);
}

/// Typed collectives layered over the byte-level [`ProcessGroup`] primitives.
pub trait Collectives: ProcessGroup {
    fn all_gather_pod<T: Pod>(&self, local: &[T]) -> Result<Vec<Vec<T>>, CollectiveError> {
        self.all_gather_bytes(bytemuck::cast_slice(local))?
            .into_iter()
            .map(|bytes| decode_pod(self.name(), &bytes))
            .collect()
    }

    fn broadcast_pod<T: Pod>(&self, root: usize, local: &[T]) -> Result<Vec<T>, CollectiveError> {
        let bytes = self.broadcast_bytes(root, bytemuck::cast_slice(local))?;
        decode_pod(self.name(), &bytes)
    }

    /// Gathers equally sized contributions and concatenates them in rank order.
    fn all_gather_concat<T: Pod>(&self, local: &[T]) -> Result<Vec<T>, CollectiveError> {
        let gathered = self.all_gather_pod(local)?;
        if let Some((rank, _)) = gathered
            .iter()
            .enumerate()
            .find(|(_, part)| part.len() != local.len())
        {
            return Err(CollectiveError::Malformed {
                group: self.name().to_owned(),
                reason: format!(
                    "rank {rank} contributed a different number of elements than rank {}",
                    self.rank()
                ),
            });
        }
        Ok(gathered.concat())
    }
}

impl<P: ProcessGroup + ?Sized> Collectives for P {}

fn decode_pod<T: Pod>(group: &str, bytes: &[u8]) -> Result<Vec<T>, CollectiveError> {
    let width = std::mem::size_of::<T>();
    if width == 0 || bytes.len() % width != 0 {
        return Err(CollectiveError::Malformed {
            group: group.to_owned(),
            reason: format!("{} bytes is not a multiple of {width}", bytes.len()),
        });
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

pub trait AllReduce {
    /// Reduces element-wise over the group. Contributions are folded in rank
    /// order, so every member ends up with bit-identical values.
    fn all_reduce(&mut self, pg: &dyn ProcessGroup, op: ReduceType) -> Result<(), CollectiveError>;
}

macro_rules! impl_all_reduce {
    ($ty:ty, $max:expr, $mean:expr) => {
        impl AllReduce for [$ty] {
            fn all_reduce(
                &mut self,
                pg: &dyn ProcessGroup,
                op: ReduceType,
            ) -> Result<(), CollectiveError> {
                if pg.size() == 1 {
                    return Ok(());
                }
                let gathered = pg.all_gather_pod::<$ty>(self)?;
                for (rank, part) in gathered.iter().enumerate() {
                    if part.len() != self.len() {
                        return Err(CollectiveError::Malformed {
                            group: pg.name().to_owned(),
                            reason: format!(
                                "rank {rank} reduced {} elements, expected {}",
                                part.len(),
                                self.len()
                            ),
                        });
                    }
                }
                for (i, value) in self.iter_mut().enumerate() {
                    let mut acc = gathered[0][i];
                    for part in &gathered[1..] {
                        acc = match op {
                            ReduceType::Sum | ReduceType::Mean => acc + part[i],
                            ReduceType::Max => $max(acc, part[i]),
                        };
                    }
                    if op == ReduceType::Mean {
                        acc = $mean(acc, gathered.len());
                    }
                    *value = acc;
                }
                Ok(())
            }
        }
    };
}

impl_all_reduce!(f32, f32::max, |acc: f32, n: usize| acc / n as f32);
impl_all_reduce!(f64, f64::max, |acc: f64, n: usize| acc / n as f64);
impl_all_reduce!(u64, std::cmp::max, |acc: u64, n: usize| acc / n as u64);

/// The trivial group of a single rank.
#[derive(Debug, Clone)]
pub struct SingleProcessGroup {
    name: String,
}

impl SingleProcessGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ProcessGroup for SingleProcessGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn all_gather_bytes(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CollectiveError> {
        Ok(vec![local.to_vec()])
    }

    fn abort(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_group_collectives_are_identity() {
        let pg = SingleProcessGroup::new("world_pg");
        let mut values = vec![1.0f32, -2.5, 3.0];
        values.all_reduce(&pg, ReduceType::Sum).unwrap();
        assert_eq!(values, vec![1.0, -2.5, 3.0]);

        assert_eq!(pg.all_gather_pod(&[7u64, 8]).unwrap(), vec![vec![7u64, 8]]);
        assert_eq!(pg.broadcast_pod(0, &[1.5f64]).unwrap(), vec![1.5f64]);
        assert_eq!(pg.all_gather_concat(&[1u32, 2]).unwrap(), vec![1u32, 2]);
    }

    #[test]
    fn broadcast_rejects_out_of_range_root() {
        let pg = SingleProcessGroup::new("dp_pg");
        let err = pg.broadcast_bytes(1, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            CollectiveError::InvalidRoot {
                group: "dp_pg".to_owned(),
                root: 1,
                size: 1
            }
        );
    }

    #[test]
    fn decode_rejects_ragged_payloads() {
        let err = decode_pod::<f32>("tp_pg", &[0u8; 6]).unwrap_err();
        assert!(matches!(err, CollectiveError::Malformed { .. }));
    }
}
