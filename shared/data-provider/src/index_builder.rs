use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use tessera_core::RandomSeed;
use tracing::{debug, info};

use crate::{
    error::{config_error, NanosetError},
    Weighting,
};

/// Dataset ids are stored as `u16`.
pub const MAX_DATASETS: usize = u16::MAX as usize;

/// How positions of the index are handed out to datasets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlendStrategy {
    /// Position `i` goes to the dataset furthest behind its target share
    /// `w_d * (i + 1)`; ties go to the lowest dataset id.
    #[default]
    Proportional,
    /// Each position draws a dataset at random with probability `w_d`.
    Sampled,
}

/// The two parallel arrays addressing every sample of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleIndex {
    pub dataset_index: Vec<u16>,
    pub dataset_sample_index: Vec<u64>,
    pub dataset_weights: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SampleIndexBuilder {
    pub dataset_lengths: Vec<usize>,
    pub weighting: Weighting,
    pub train_split_num_samples: usize,
    pub random_seed: RandomSeed,
    pub blend: BlendStrategy,
    pub max_epochs: Option<usize>,
}

impl SampleIndexBuilder {
    pub fn build(&self) -> Result<SampleIndex, NanosetError> {
        let num_datasets = self.dataset_lengths.len();
        if num_datasets > MAX_DATASETS {
            return Err(config_error!(
                "{num_datasets} datasets given, at most {MAX_DATASETS} are supported"
            ));
        }
        if self.train_split_num_samples == 0 {
            return Err(config_error!("train_split_num_samples must be positive"));
        }
        let weights = self.weighting.resolve(num_datasets)?;
        for (dataset, (&length, &weight)) in
            self.dataset_lengths.iter().zip(&weights).enumerate()
        {
            if weight > 0.0 && length == 0 {
                return Err(config_error!(
                    "dataset {dataset} has weight {weight} but holds no samples of \
                     this sequence length"
                ));
            }
        }

        let dataset_index = match self.blend {
            BlendStrategy::Proportional => {
                proportional_blend(&weights, self.train_split_num_samples)
            }
            BlendStrategy::Sampled => {
                sampled_blend(&weights, self.train_split_num_samples, self.random_seed)
            }
        };

        let mut counts = vec![0usize; num_datasets];
        for &dataset in &dataset_index {
            counts[dataset as usize] += 1;
        }
        if let Some(max_epochs) = self.max_epochs {
            for (dataset, (&count, &length)) in
                counts.iter().zip(&self.dataset_lengths).enumerate()
            {
                if count > length.saturating_mul(max_epochs) {
                    return Err(config_error!(
                        "dataset {dataset} needs {count} samples but holds {length} per epoch, \
                         more than max_epochs = {max_epochs} allows"
                    ));
                }
            }
        }

        let mut orders: Vec<EpochOrder> = self
            .dataset_lengths
            .iter()
            .enumerate()
            .map(|(dataset, &length)| EpochOrder::new(dataset, length))
            .collect();
        let dataset_sample_index = dataset_index
            .iter()
            .map(|&dataset| orders[dataset as usize].next(self.random_seed))
            .collect();

        for (dataset, (&count, &length)) in counts.iter().zip(&self.dataset_lengths).enumerate() {
            debug!(
                dataset,
                samples = count,
                length,
                epochs = if length == 0 { 0 } else { count.div_ceil(length) },
                "Dataset usage"
            );
        }
        info!(
            num_datasets,
            num_samples = self.train_split_num_samples,
            blend = ?self.blend,
            seed = self.random_seed.value(),
            "Built sample index"
        );

        Ok(SampleIndex {
            dataset_index,
            dataset_sample_index,
            dataset_weights: weights,
        })
    }
}

fn proportional_blend(weights: &[f64], num_samples: usize) -> Vec<u16> {
    let mut placed = vec![0usize; weights.len()];
    (0..num_samples)
        .map(|i| {
            let target = (i + 1) as f64;
            let mut best = 0;
            let mut best_error = f64::NEG_INFINITY;
            for (dataset, &weight) in weights.iter().enumerate() {
                if weight <= 0.0 {
                    continue;
                }
                let error = weight * target - placed[dataset] as f64;
                if error > best_error {
                    best = dataset;
                    best_error = error;
                }
            }
            placed[best] += 1;
            best as u16
        })
        .collect()
}

fn sampled_blend(weights: &[f64], num_samples: usize, seed: RandomSeed) -> Vec<u16> {
    let cumulative: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    let total = cumulative.last().copied().unwrap_or(0.0);
    let mut rng = seed.stream("blend", &[]);
    (0..num_samples)
        .map(|_| {
            let draw = rng.random::<f64>() * total;
            let dataset = cumulative.partition_point(|&edge| edge <= draw);
            dataset.min(weights.len() - 1) as u16
        })
        .collect()
}

/// Walks one dataset epoch by epoch, each epoch in its own seeded order.
struct EpochOrder {
    dataset: usize,
    length: usize,
    epoch: usize,
    position: usize,
    order: Vec<u64>,
}

impl EpochOrder {
    fn new(dataset: usize, length: usize) -> Self {
        Self {
            dataset,
            length,
            epoch: 0,
            position: 0,
            order: Vec::new(),
        }
    }

    fn next(&mut self, seed: RandomSeed) -> u64 {
        if self.order.is_empty() || self.position == self.length {
            if !self.order.is_empty() {
                self.epoch += 1;
            }
            self.order = epoch_permutation(seed, self.dataset, self.epoch, self.length);
            self.position = 0;
        }
        let sample = self.order[self.position];
        self.position += 1;
        sample
    }
}

/// The order in which epoch `epoch` of dataset `dataset` visits its samples.
pub fn epoch_permutation(
    seed: RandomSeed,
    dataset: usize,
    epoch: usize,
    length: usize,
) -> Vec<u64> {
    let mut order: Vec<u64> = (0..length as u64).collect();
    let mut rng = seed.stream("sample-order", &[dataset as u64, epoch as u64]);
    order.shuffle(&mut rng);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn builder(lengths: &[usize], weighting: Weighting, samples: usize) -> SampleIndexBuilder {
        SampleIndexBuilder {
            dataset_lengths: lengths.to_vec(),
            weighting,
            train_split_num_samples: samples,
            random_seed: RandomSeed::new(1234),
            blend: BlendStrategy::Proportional,
            max_epochs: None,
        }
    }

    fn counts(index: &SampleIndex, num_datasets: usize) -> Vec<usize> {
        let mut counts = vec![0; num_datasets];
        for &d in &index.dataset_index {
            counts[d as usize] += 1;
        }
        counts
    }

    #[test]
    fn proportional_placement_is_exact() {
        let index = builder(&[50, 100], Weighting::Explicit(vec![8.0, 2.0]), 1000)
            .build()
            .unwrap();
        assert_eq!(counts(&index, 2), vec![800, 200]);
        // every prefix stays within one sample of its target
        let mut placed = 0usize;
        for (i, &d) in index.dataset_index.iter().enumerate() {
            placed += (d == 0) as usize;
            assert!((0.8 * (i + 1) as f64 - placed as f64).abs() < 1.0 + 1e-9);
        }
    }

    #[test]
    fn offsets_stay_in_bounds_and_cover_each_epoch() {
        let index = builder(&[7, 13], Weighting::Uniform, 40).build().unwrap();
        let mut first_epoch = BTreeSet::new();
        for (&d, &s) in index.dataset_index.iter().zip(&index.dataset_sample_index) {
            assert!((s as usize) < [7, 13][d as usize]);
            if d == 0 && first_epoch.len() < 7 {
                first_epoch.insert(s);
            }
        }
        assert_eq!(first_epoch, (0..7).collect::<BTreeSet<u64>>());
    }

    #[test]
    fn epochs_use_independent_orders() {
        let seed = RandomSeed::new(7);
        assert_ne!(
            epoch_permutation(seed, 0, 0, 64),
            epoch_permutation(seed, 0, 1, 64)
        );
        assert_ne!(
            epoch_permutation(seed, 0, 0, 64),
            epoch_permutation(seed, 1, 0, 64)
        );
    }

    #[test]
    fn build_is_a_pure_function_of_inputs() {
        for blend in [BlendStrategy::Proportional, BlendStrategy::Sampled] {
            let mut b = builder(&[30, 40, 50], Weighting::Explicit(vec![1.0, 2.0, 3.0]), 500);
            b.blend = blend;
            assert_eq!(b.build().unwrap(), b.build().unwrap());
            b.random_seed = RandomSeed::new(1235);
            let reseeded = b.build().unwrap();
            b.random_seed = RandomSeed::new(1234);
            assert_ne!(b.build().unwrap().dataset_sample_index, reseeded.dataset_sample_index);
        }
    }

    #[test]
    fn sampled_blend_tracks_weights() {
        let mut b = builder(&[1000, 1000], Weighting::Explicit(vec![0.8, 0.2]), 20_000);
        b.blend = BlendStrategy::Sampled;
        let share = counts(&b.build().unwrap(), 2)[0] as f64 / 20_000.0;
        assert!((share - 0.8).abs() < 0.02, "share {share}");
    }

    #[test]
    fn zero_weight_dataset_is_never_used() {
        for blend in [BlendStrategy::Proportional, BlendStrategy::Sampled] {
            let mut b = builder(&[10, 0, 10], Weighting::Explicit(vec![1.0, 0.0, 1.0]), 100);
            b.blend = blend;
            assert_eq!(counts(&b.build().unwrap(), 3)[1], 0);
        }
    }

    #[test]
    fn configuration_errors() {
        let cases = [
            builder(&[10, 10], Weighting::Explicit(vec![1.0]), 10),
            builder(&[10], Weighting::Uniform, 0),
            builder(&[], Weighting::Uniform, 10),
            builder(&[10, 0], Weighting::Uniform, 10),
            SampleIndexBuilder {
                max_epochs: Some(2),
                ..builder(&[10], Weighting::Uniform, 21)
            },
            builder(&vec![1; MAX_DATASETS + 1], Weighting::Uniform, 10),
        ];
        for case in cases {
            assert!(
                matches!(case.build(), Err(NanosetError::Configuration(_))),
                "{case:?}"
            );
        }

        let within_epochs = SampleIndexBuilder {
            max_epochs: Some(2),
            ..builder(&[10], Weighting::Uniform, 20)
        };
        within_epochs.build().unwrap();
    }
}
