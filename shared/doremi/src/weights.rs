use tracing::debug;

use crate::{
    error::{config_error, shape_error, DoReMiError},
    DoReMiContext,
};

/// Exponentiated-gradient update of the domain weights.
///
/// Losses are first smoothed with an exponential moving average kept in the
/// context. The update itself runs in log space:
/// `ln w + step_size * smoothed - logsumexp(...)`, then mixes in
/// `smoothing_param` of the uniform distribution and renormalizes.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightUpdater;

impl WeightUpdater {
    /// Updates `context` in place and returns the new weights.
    pub fn step(
        context: &mut DoReMiContext,
        domain_losses: &[f32],
    ) -> Result<Vec<f32>, DoReMiError> {
        let num_domains = context.num_domains();
        if domain_losses.len() != num_domains {
            return Err(shape_error!(
                "{} domain losses for {num_domains} domains",
                domain_losses.len()
            ));
        }
        if let Some(domain) = domain_losses.iter().position(|loss| !loss.is_finite()) {
            return Err(config_error!(
                "loss of domain {domain} is {}",
                domain_losses[domain]
            ));
        }

        let smoothed = Self::smooth(
            context.smoothed_losses.as_deref(),
            domain_losses,
            context.ema_decay(),
        );
        let weights = Self::exponentiated_gradient(
            &context.domain_weights,
            &smoothed,
            context.step_size(),
            context.smoothing_param(),
        );

        debug!(
            step = context.num_updates,
            ?smoothed,
            before = ?context.domain_weights,
            after = ?weights,
            "Updated domain weights"
        );
        context.smoothed_losses = Some(smoothed);
        context.domain_weights = weights.clone();
        context.num_updates += 1;
        Ok(weights)
    }

    fn smooth(previous: Option<&[f32]>, current: &[f32], ema_decay: f32) -> Vec<f32> {
        match previous {
            None => current.to_vec(),
            Some(previous) => previous
                .iter()
                .zip(current)
                .map(|(&prev, &cur)| ema_decay * prev + (1.0 - ema_decay) * cur)
                .collect(),
        }
    }

    pub fn exponentiated_gradient(
        weights: &[f32],
        losses: &[f32],
        step_size: f32,
        smoothing_param: f32,
    ) -> Vec<f32> {
        let num_domains = weights.len() as f64;
        let log_weights: Vec<f64> = weights
            .iter()
            .zip(losses)
            .map(|(&w, &loss)| (w as f64).ln() + step_size as f64 * loss as f64)
            .collect();
        let max = log_weights
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let log_sum_exp = max + log_weights.iter().map(|lw| (lw - max).exp()).sum::<f64>().ln();

        let smoothing = smoothing_param as f64;
        let mixed: Vec<f64> = log_weights
            .iter()
            .map(|lw| (1.0 - smoothing) * (lw - log_sum_exp).exp() + smoothing / num_domains)
            .collect();
        let total: f64 = mixed.iter().sum();
        mixed.iter().map(|w| (w / total) as f32).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DoReMiConfig;
    use pretty_assertions::assert_eq;

    fn context(n: usize) -> DoReMiContext {
        let keys = (0..n).map(|i| format!("d{i}")).collect();
        DoReMiContext::new(vec![1.0; n], keys, true).unwrap()
    }

    #[test]
    fn high_loss_domain_gains_weight() {
        let mut context = context(5);
        let weights = WeightUpdater::step(&mut context, &[0.1, 0.1, 5.0, 0.1, 0.1]).unwrap();

        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(weights.iter().all(|w| *w > 0.0));
        assert!(weights[2] > 0.2);
        for (domain, &w) in weights.iter().enumerate() {
            if domain != 2 {
                assert!(w < 0.2);
                assert_eq!(w, weights[0]);
            }
        }
        assert_eq!(context.domain_weights(), weights.as_slice());
        assert_eq!(context.num_updates(), 1);
    }

    #[test]
    fn uniform_losses_keep_uniform_weights() {
        let mut context = context(4);
        let weights = WeightUpdater::step(&mut context, &[0.7; 4]).unwrap();
        for w in weights {
            assert!((w - 0.25).abs() < 1e-7);
        }
    }

    #[test]
    fn losses_are_smoothed_after_the_first_step() {
        let mut context = context(2);
        WeightUpdater::step(&mut context, &[1.0, 0.0]).unwrap();
        assert_eq!(context.smoothed_losses(), Some(&[1.0, 0.0][..]));

        WeightUpdater::step(&mut context, &[0.0, 1.0]).unwrap();
        let smoothed = context.smoothed_losses().unwrap();
        assert!((smoothed[0] - 0.9).abs() < 1e-6);
        assert!((smoothed[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn smoothing_keeps_every_domain_alive() {
        let weights = WeightUpdater::exponentiated_gradient(&[0.5, 0.5], &[0.0, 200.0], 1.0, 1e-3);
        assert!(weights[0] >= 5e-4 * 0.99);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn extreme_losses_keep_weights_positive() {
        let keys = vec!["low".to_string(), "high".to_string()];
        let config = DoReMiConfig {
            smoothing_param: 1e-6,
            ..DoReMiConfig::new(keys)
        };
        let mut context = DoReMiContext::from_config(config, true).unwrap();
        for _ in 0..3 {
            let weights = WeightUpdater::step(&mut context, &[0.0, 120.0]).unwrap();
            assert!(weights.iter().all(|&w| w > 0.0), "{weights:?}");
            assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_wrong_length_and_non_finite_losses() {
        let mut context = context(3);
        assert!(matches!(
            WeightUpdater::step(&mut context, &[1.0, 2.0]),
            Err(DoReMiError::Shape(_))
        ));
        assert!(matches!(
            WeightUpdater::step(&mut context, &[1.0, f32::NAN, 0.0]),
            Err(DoReMiError::Configuration(_))
        ));
        assert_eq!(context.num_updates(), 0);
    }
}
