use tessera_core::SampleRange;
use tracing::trace;

use crate::error::{config_error, NanosetError};

/// Cuts the global sample stream into per-rank micro-batches.
///
/// Every step covers `micro_batch_size * dp_size` consecutive global samples
/// starting at the cursor; data-parallel rank `r` owns the `r`-th
/// `micro_batch_size` slice of it. Starting the cursor at the number of
/// samples consumed by an earlier run resumes exactly where that run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumableBatchSampler {
    total_samples: u64,
    cursor: u64,
    micro_batch_size: u64,
    dp_rank: u64,
    dp_size: u64,
    drop_last: bool,
}

impl ResumableBatchSampler {
    pub fn new(
        total_samples: usize,
        consumed_samples: usize,
        micro_batch_size: usize,
        dp_rank: usize,
        dp_size: usize,
        drop_last: bool,
    ) -> Result<Self, NanosetError> {
        if micro_batch_size == 0 {
            return Err(config_error!("micro_batch_size must be positive"));
        }
        if dp_size == 0 {
            return Err(config_error!("data parallel size must be positive"));
        }
        if dp_rank >= dp_size {
            return Err(config_error!(
                "data parallel rank {dp_rank} is out of range for size {dp_size}"
            ));
        }
        if consumed_samples > total_samples {
            return Err(config_error!(
                "{consumed_samples} samples were already consumed but the dataset only has \
                 {total_samples}"
            ));
        }

        Ok(Self {
            total_samples: total_samples as u64,
            cursor: consumed_samples as u64,
            micro_batch_size: micro_batch_size as u64,
            dp_rank: dp_rank as u64,
            dp_size: dp_size as u64,
            drop_last,
        })
    }

    pub fn global_batch_size(&self) -> u64 {
        self.micro_batch_size * self.dp_size
    }

    /// Global samples consumed so far, by every rank together.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn remaining_batches(&self) -> u64 {
        let remaining = self.total_samples - self.cursor;
        if self.drop_last {
            remaining / self.global_batch_size()
        } else {
            remaining.div_ceil(self.global_batch_size())
        }
    }
}

impl Iterator for ResumableBatchSampler {
    type Item = SampleRange;

    fn next(&mut self) -> Option<Self::Item> {
        let global_batch_size = self.global_batch_size();
        let remaining = self.total_samples - self.cursor;
        if remaining == 0 || (self.drop_last && remaining < global_batch_size) {
            return None;
        }

        let start = self.cursor + self.dp_rank * self.micro_batch_size;
        let range = SampleRange::new(
            start.min(self.total_samples),
            (start + self.micro_batch_size).min(self.total_samples),
        );
        self.cursor = (self.cursor + global_batch_size).min(self.total_samples);
        trace!(dp_rank = self.dp_rank, %range, cursor = self.cursor, "Sampled micro-batch");
        Some(range)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining_batches() as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ResumableBatchSampler {}
