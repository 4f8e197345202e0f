use serde::{Deserialize, Serialize};

use crate::error::{config_error, NanosetError};

/// How samples are spread over datasets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    #[default]
    Uniform,
    /// One non-negative weight per dataset, normalized on resolution.
    Explicit(Vec<f64>),
}

impl From<Option<Vec<f64>>> for Weighting {
    fn from(value: Option<Vec<f64>>) -> Self {
        match value {
            Some(weights) => Weighting::Explicit(weights),
            None => Weighting::Uniform,
        }
    }
}

impl Weighting {
    /// Resolves to a probability simplex over `num_datasets` datasets.
    pub fn resolve(&self, num_datasets: usize) -> Result<Vec<f64>, NanosetError> {
        if num_datasets == 0 {
            return Err(config_error!("at least one dataset is required"));
        }
        match self {
            Weighting::Uniform => Ok(vec![1.0 / num_datasets as f64; num_datasets]),
            Weighting::Explicit(weights) => {
                if weights.len() != num_datasets {
                    return Err(config_error!(
                        "got {} dataset weights for {num_datasets} datasets",
                        weights.len()
                    ));
                }
                if let Some((dataset, weight)) = weights
                    .iter()
                    .enumerate()
                    .find(|(_, w)| !w.is_finite() || **w < 0.0)
                {
                    return Err(config_error!(
                        "weight {weight} of dataset {dataset} must be finite and non-negative"
                    ));
                }
                let total: f64 = weights.iter().sum();
                if total <= 0.0 || !total.is_finite() {
                    return Err(config_error!("dataset weights must have a positive sum"));
                }
                Ok(weights.iter().map(|w| w / total).collect())
            }
        }
    }
}
