use serde::{Deserialize, Serialize};
use tessera_data_provider::Weighting;

use crate::error::{config_error, DoReMiError};

fn default_step_size() -> f32 {
    1.0
}

fn default_smoothing_param() -> f32 {
    1e-3
}

fn default_ema_decay() -> f32 {
    0.9
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DoReMiConfig {
    pub domain_keys: Vec<String>,
    /// Initial weights; uniform when absent.
    #[serde(default)]
    pub domain_weights: Option<Vec<f32>>,
    #[serde(default = "default_step_size")]
    pub step_size: f32,
    #[serde(default = "default_smoothing_param")]
    pub smoothing_param: f32,
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f32,
}

impl DoReMiConfig {
    pub fn new(domain_keys: Vec<String>) -> Self {
        Self {
            domain_keys,
            domain_weights: None,
            step_size: default_step_size(),
            smoothing_param: default_smoothing_param(),
            ema_decay: default_ema_decay(),
        }
    }
}

/// Domain weights and update hyper-parameters for one training run.
///
/// The context has exactly one writer: the proxy loss updates the weights once
/// per step, from inputs that are already identical on every data-parallel
/// rank.
#[derive(Debug, Clone, PartialEq)]
pub struct DoReMiContext {
    domain_keys: Vec<String>,
    pub(crate) domain_weights: Vec<f32>,
    is_proxy: bool,
    step_size: f32,
    smoothing_param: f32,
    ema_decay: f32,
    pub(crate) smoothed_losses: Option<Vec<f32>>,
    pub(crate) num_updates: u64,
}

impl DoReMiContext {
    pub fn new(
        domain_weights: Vec<f32>,
        domain_keys: Vec<String>,
        is_proxy: bool,
    ) -> Result<Self, DoReMiError> {
        Self::from_config(
            DoReMiConfig {
                domain_weights: Some(domain_weights),
                ..DoReMiConfig::new(domain_keys)
            },
            is_proxy,
        )
    }

    pub fn from_config(config: DoReMiConfig, is_proxy: bool) -> Result<Self, DoReMiError> {
        let num_domains = config.domain_keys.len();
        if num_domains == 0 {
            return Err(config_error!("at least one domain is required"));
        }
        if !(config.step_size.is_finite() && config.step_size > 0.0) {
            return Err(config_error!("step_size must be positive, got {}", config.step_size));
        }
        // zero lets a weight underflow to exactly 0, one pins the weights to uniform
        if !(config.smoothing_param > 0.0 && config.smoothing_param < 1.0) {
            return Err(config_error!(
                "smoothing_param must lie in (0, 1), got {}",
                config.smoothing_param
            ));
        }
        if !(0.0..1.0).contains(&config.ema_decay) {
            return Err(config_error!(
                "ema_decay must lie in [0, 1), got {}",
                config.ema_decay
            ));
        }

        let domain_weights = match config.domain_weights {
            None => vec![1.0 / num_domains as f32; num_domains],
            Some(weights) => {
                if weights.len() != num_domains {
                    return Err(config_error!(
                        "got {} domain weights for {num_domains} domains",
                        weights.len()
                    ));
                }
                if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                    return Err(config_error!("domain weights must be finite and non-negative"));
                }
                let total: f32 = weights.iter().sum();
                if total <= 0.0 {
                    return Err(config_error!("domain weights must have a positive sum"));
                }
                weights.iter().map(|w| w / total).collect()
            }
        };

        Ok(Self {
            domain_keys: config.domain_keys,
            domain_weights,
            is_proxy,
            step_size: config.step_size,
            smoothing_param: config.smoothing_param,
            ema_decay: config.ema_decay,
            smoothed_losses: None,
            num_updates: 0,
        })
    }

    pub fn num_domains(&self) -> usize {
        self.domain_keys.len()
    }

    pub fn domain_keys(&self) -> &[String] {
        &self.domain_keys
    }

    pub fn domain_weights(&self) -> &[f32] {
        &self.domain_weights
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }

    pub fn step_size(&self) -> f32 {
        self.step_size
    }

    pub fn smoothing_param(&self) -> f32 {
        self.smoothing_param
    }

    pub fn ema_decay(&self) -> f32 {
        self.ema_decay
    }

    /// Running average of the per-domain losses fed to the weight update.
    pub fn smoothed_losses(&self) -> Option<&[f32]> {
        self.smoothed_losses.as_deref()
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    /// The current weights as a dataset weighting, for resampling.
    pub fn dataset_weighting(&self) -> Weighting {
        Weighting::Explicit(self.domain_weights.iter().map(|&w| w as f64).collect())
    }
}
