use tessera_parallel::{
    verify_values_synced_across_pg, AllReduce, Collectives, ParallelContext, ProcessGroup,
    ReduceType,
};
use tracing::trace;

use crate::{
    error::{config_error, shape_error, DoReMiError},
    DoReMiContext, ShardedLogits, TokenLosses, WeightUpdater,
};

/// Per-domain statistics of one step, reduced over the data-parallel group.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainLossStats {
    pub loss_sums: Vec<f64>,
    /// Tokens that count towards each domain's mean; masked tokens are left out.
    pub token_counts: Vec<u64>,
    pub sample_counts: Vec<u64>,
    /// `loss_sums / token_counts`, zero for domains absent from the step.
    pub domain_losses: Vec<f32>,
    /// Losses of every rank's micro-batch, stacked in rank order.
    pub global_losses: TokenLosses,
    pub global_domain_idxs: Vec<u16>,
}

/// Aggregates per-token losses by domain across the data-parallel group.
#[derive(Debug, Clone, Copy)]
pub struct DomainLossAggregator<'a> {
    num_domains: usize,
    dp_pg: &'a dyn ProcessGroup,
}

impl<'a> DomainLossAggregator<'a> {
    pub fn new(num_domains: usize, dp_pg: &'a dyn ProcessGroup) -> Self {
        Self { num_domains, dp_pg }
    }

    fn check_inputs(&self, losses: &TokenLosses, domain_idxs: &[u16]) -> Result<(), DoReMiError> {
        if domain_idxs.len() != losses.batch_size() {
            return Err(shape_error!(
                "{} domain ids for a batch of {}",
                domain_idxs.len(),
                losses.batch_size()
            ));
        }
        if let Some(&domain) = domain_idxs
            .iter()
            .find(|&&d| d as usize >= self.num_domains)
        {
            return Err(shape_error!(
                "domain id {domain} is outside [0, {})",
                self.num_domains
            ));
        }
        Ok(())
    }

    /// Every rank gathers the whole group's losses and reduces them in rank
    /// order, so the statistics are bit-identical everywhere.
    pub fn aggregate(
        &self,
        losses: &TokenLosses,
        domain_idxs: &[u16],
    ) -> Result<DomainLossStats, DoReMiError> {
        self.reduce(losses, None, domain_idxs)
    }

    /// Like [`DomainLossAggregator::aggregate`], but only tokens whose
    /// `token_mask` entry is set contribute to a domain's sum and count.
    pub fn aggregate_masked(
        &self,
        losses: &TokenLosses,
        token_mask: &[bool],
        domain_idxs: &[u16],
    ) -> Result<DomainLossStats, DoReMiError> {
        if token_mask.len() != losses.data().len() {
            return Err(shape_error!(
                "token mask has {} entries for {:?} losses",
                token_mask.len(),
                losses.shape()
            ));
        }
        self.reduce(losses, Some(token_mask), domain_idxs)
    }

    fn reduce(
        &self,
        losses: &TokenLosses,
        token_mask: Option<&[bool]>,
        domain_idxs: &[u16],
    ) -> Result<DomainLossStats, DoReMiError> {
        self.check_inputs(losses, domain_idxs)?;

        let seq_lens = self.dp_pg.all_gather_concat(&[losses.seq_len() as u64])?;
        if let Some(rank) = seq_lens.iter().position(|&s| s != seq_lens[0]) {
            return Err(shape_error!(
                "rank {rank} of {} has sequence length {}, rank 0 has {}",
                self.dp_pg.name(),
                seq_lens[rank],
                seq_lens[0]
            ));
        }
        let seq_len = seq_lens[0] as usize;

        let global_losses: Vec<f32> = self.dp_pg.all_gather_pod(losses.data())?.concat();
        let global_domain_idxs: Vec<u16> = self.dp_pg.all_gather_pod(domain_idxs)?.concat();
        let global_losses = TokenLosses::new(global_domain_idxs.len(), seq_len, global_losses)?;
        let global_mask: Option<Vec<u8>> = match token_mask {
            Some(mask) => {
                let mask: Vec<u8> = mask.iter().map(|&keep| keep as u8).collect();
                Some(self.dp_pg.all_gather_pod(&mask)?.concat())
            }
            None => None,
        };

        let mut loss_sums = vec![0f64; self.num_domains];
        let mut token_counts = vec![0u64; self.num_domains];
        let mut sample_counts = vec![0u64; self.num_domains];
        for (row_index, (row, &domain)) in global_losses
            .rows()
            .zip(&global_domain_idxs)
            .enumerate()
        {
            let domain = domain as usize;
            if domain >= self.num_domains {
                return Err(shape_error!(
                    "a peer sent domain id {domain}, outside [0, {})",
                    self.num_domains
                ));
            }
            match &global_mask {
                Some(mask) => {
                    let row_mask = &mask[row_index * seq_len..(row_index + 1) * seq_len];
                    for (&loss, &keep) in row.iter().zip(row_mask) {
                        if keep != 0 {
                            loss_sums[domain] += loss as f64;
                            token_counts[domain] += 1;
                        }
                    }
                }
                None => {
                    loss_sums[domain] += row.iter().map(|&x| x as f64).sum::<f64>();
                    token_counts[domain] += seq_len as u64;
                }
            }
            sample_counts[domain] += 1;
        }

        let domain_losses = loss_sums
            .iter()
            .zip(&token_counts)
            .map(|(&sum, &count)| {
                let mean = if count == 0 { 0.0 } else { sum / count as f64 };
                if mean.is_nan() {
                    0.0
                } else {
                    mean as f32
                }
            })
            .collect();

        trace!(?sample_counts, "Aggregated domain losses");
        Ok(DomainLossStats {
            loss_sums,
            token_counts,
            sample_counts,
            domain_losses,
            global_losses,
            global_domain_idxs,
        })
    }
}

/// Mean loss per domain over the whole data-parallel group.
pub fn compute_per_domain_loss(
    losses: &TokenLosses,
    domain_idxs: &[u16],
    context: &DoReMiContext,
    parallel_context: &ParallelContext,
) -> Result<Vec<f32>, DoReMiError> {
    Ok(
        DomainLossAggregator::new(context.num_domains(), parallel_context.dp_pg.as_ref())
            .aggregate(losses, domain_idxs)?
            .domain_losses,
    )
}

/// `max(loss - ref_loss, 0)` per token.
pub fn compute_excess_losses(
    losses: &TokenLosses,
    ref_losses: &TokenLosses,
) -> Result<TokenLosses, DoReMiError> {
    losses.zip_map(ref_losses, |loss, reference| (loss - reference).max(0.0))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoReMiProxyOutput {
    pub lm_loss: f32,
    /// Excess losses of the whole data-parallel group, `[dp * batch_size, seq_len]`.
    pub excess_losses: TokenLosses,
    pub domain_losses: Vec<f32>,
    pub domain_weights: Vec<f32>,
    pub samples_per_domain: Vec<u64>,
}

/// Loss of the proxy model: domain-weighted excess loss over a reference model,
/// updating the domain weights once per call.
pub struct DoReMiLossForProxyTraining<'a> {
    context: &'a mut DoReMiContext,
    parallel_context: &'a ParallelContext,
    verify_sync: bool,
}

impl<'a> DoReMiLossForProxyTraining<'a> {
    pub fn new(
        context: &'a mut DoReMiContext,
        parallel_context: &'a ParallelContext,
    ) -> Result<Self, DoReMiError> {
        if !context.is_proxy() {
            return Err(config_error!(
                "proxy training needs a context created with is_proxy = true"
            ));
        }
        Ok(Self {
            context,
            parallel_context,
            verify_sync: true,
        })
    }

    /// Skips the cross-rank check of domain losses and weights after each step.
    pub fn without_sync_checks(mut self) -> Self {
        self.verify_sync = false;
        self
    }

    pub fn context(&self) -> &DoReMiContext {
        &*self.context
    }

    pub fn forward(
        &mut self,
        losses: &TokenLosses,
        ref_losses: &TokenLosses,
        domain_idxs: &[u16],
    ) -> Result<DoReMiProxyOutput, DoReMiError> {
        let excess_losses = compute_excess_losses(losses, ref_losses)?;
        let dp_pg = self.parallel_context.dp_pg.as_ref();
        let stats = DomainLossAggregator::new(self.context.num_domains(), dp_pg)
            .aggregate(&excess_losses, domain_idxs)?;

        let domain_weights = WeightUpdater::step(self.context, &stats.domain_losses)?;
        let lm_loss = domain_weights
            .iter()
            .zip(&stats.domain_losses)
            .map(|(&w, &loss)| w * loss)
            .sum();

        if self.verify_sync {
            verify_values_synced_across_pg(dp_pg, "domain losses", &stats.domain_losses)?;
            verify_values_synced_across_pg(dp_pg, "domain weights", &domain_weights)?;
        }

        Ok(DoReMiProxyOutput {
            lm_loss,
            excess_losses: stats.global_losses,
            domain_losses: stats.domain_losses,
            domain_weights,
            samples_per_domain: stats.sample_counts,
        })
    }
}

/// Cross entropy of logits whose vocabulary dimension is split across `tp_pg`.
///
/// Each rank reduces over its own vocabulary slice; the row max, the sum of
/// exponentials and the target logit are then all-reduced over the group.
pub fn sharded_cross_entropy(
    logits: &ShardedLogits,
    targets: &[u32],
    tp_pg: &dyn ProcessGroup,
) -> Result<Vec<f32>, DoReMiError> {
    if targets.len() != logits.num_tokens() {
        return Err(shape_error!(
            "{} targets for {} tokens",
            targets.len(),
            logits.num_tokens()
        ));
    }
    if logits.shard_width() * tp_pg.size() != logits.vocab_size() {
        return Err(shape_error!(
            "shards of width {} over {} ranks do not cover a vocabulary of {}",
            logits.shard_width(),
            tp_pg.size(),
            logits.vocab_size()
        ));
    }
    if let Some(&target) = targets.iter().find(|&&t| t as usize >= logits.vocab_size()) {
        return Err(shape_error!(
            "target {target} is outside a vocabulary of {}",
            logits.vocab_size()
        ));
    }

    let vocab_start = tp_pg.rank() * logits.shard_width();
    let vocab_end = vocab_start + logits.shard_width();
    let num_tokens = logits.num_tokens();

    let mut row_max: Vec<f32> = (0..num_tokens)
        .map(|t| logits.row(t).iter().copied().fold(f32::NEG_INFINITY, f32::max))
        .collect();
    row_max.all_reduce(tp_pg, ReduceType::Max)?;

    let mut sum_exp: Vec<f32> = (0..num_tokens)
        .map(|t| logits.row(t).iter().map(|&x| (x - row_max[t]).exp()).sum())
        .collect();
    sum_exp.all_reduce(tp_pg, ReduceType::Sum)?;

    let mut target_logit: Vec<f32> = targets
        .iter()
        .enumerate()
        .map(|(t, &target)| {
            let target = target as usize;
            if (vocab_start..vocab_end).contains(&target) {
                logits.row(t)[target - vocab_start] - row_max[t]
            } else {
                0.0
            }
        })
        .collect();
    target_logit.all_reduce(tp_pg, ReduceType::Sum)?;

    Ok(sum_exp
        .iter()
        .zip(&target_logit)
        .map(|(&sum, &target)| sum.ln() - target)
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossEntropyOutput {
    /// Mean over the tokens selected by the label mask.
    pub loss: f32,
    pub domain_losses: Vec<f32>,
}

/// Language-modeling loss of the reference model, tracked per domain.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropyWithPerDomainLoss<'a> {
    context: &'a DoReMiContext,
    parallel_context: &'a ParallelContext,
}

impl<'a> CrossEntropyWithPerDomainLoss<'a> {
    pub fn new(context: &'a DoReMiContext, parallel_context: &'a ParallelContext) -> Self {
        Self {
            context,
            parallel_context,
        }
    }

    /// `logits` hold `batch_size * seq_len` tokens in row-major order.
    pub fn forward(
        &self,
        logits: &ShardedLogits,
        label_ids: &[u32],
        label_mask: &[bool],
        domain_idxs: &[u16],
    ) -> Result<CrossEntropyOutput, DoReMiError> {
        let batch_size = domain_idxs.len();
        if batch_size == 0 || logits.num_tokens() % batch_size != 0 {
            return Err(shape_error!(
                "{} tokens do not split into {batch_size} rows",
                logits.num_tokens()
            ));
        }
        if label_mask.len() != label_ids.len() {
            return Err(shape_error!(
                "label mask has {} entries for {} labels",
                label_mask.len(),
                label_ids.len()
            ));
        }
        let seq_len = logits.num_tokens() / batch_size;

        let per_token =
            sharded_cross_entropy(logits, label_ids, self.parallel_context.tp_pg.as_ref())?;
        let masked: Vec<f32> = per_token
            .iter()
            .zip(label_mask)
            .map(|(&loss, &keep)| if keep { loss } else { 0.0 })
            .collect();
        let kept = label_mask.iter().filter(|&&keep| keep).count();
        let loss = if kept == 0 {
            0.0
        } else {
            masked.iter().sum::<f32>() / kept as f32
        };

        let per_token = TokenLosses::new(batch_size, seq_len, masked)?;
        let domain_losses = DomainLossAggregator::new(
            self.context.num_domains(),
            self.parallel_context.dp_pg.as_ref(),
        )
        .aggregate_masked(&per_token, label_mask, domain_idxs)?
        .domain_losses;
        Ok(CrossEntropyOutput {
            loss,
            domain_losses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context(n: usize) -> DoReMiContext {
        let keys = (0..n).map(|i| format!("d{i}")).collect();
        DoReMiContext::new(vec![1.0; n], keys, true).unwrap()
    }

    #[test]
    fn excess_loss_is_clamped() {
        let losses = TokenLosses::from_rows(&[vec![1.0, 3.0], vec![0.5, 2.0]]).unwrap();
        let reference = TokenLosses::from_rows(&[vec![2.0, 1.0], vec![0.5, 2.5]]).unwrap();
        let excess = compute_excess_losses(&losses, &reference).unwrap();
        assert_eq!(excess.data(), &[0.0, 2.0, 0.0, 0.0]);

        let wrong = TokenLosses::filled(1, 2, 0.0);
        assert!(matches!(
            compute_excess_losses(&losses, &wrong),
            Err(DoReMiError::Shape(_))
        ));
    }

    #[test]
    fn single_rank_domain_means() {
        let parallel_context = ParallelContext::single();
        let losses =
            TokenLosses::from_rows(&[vec![1.0, 3.0], vec![4.0, 4.0], vec![0.0, 2.0]]).unwrap();
        let domain_losses =
            compute_per_domain_loss(&losses, &[0, 1, 0], &context(3), &parallel_context).unwrap();
        assert_eq!(domain_losses, vec![1.5, 4.0, 0.0]);
    }

    #[test]
    fn masked_tokens_are_left_out_of_domain_means() {
        let parallel_context = ParallelContext::single();
        let losses =
            TokenLosses::from_rows(&[vec![1.0, 3.0], vec![4.0, 0.0], vec![0.0, 0.0]]).unwrap();
        let mask = [true, true, true, false, false, false];
        let stats = DomainLossAggregator::new(3, parallel_context.dp_pg.as_ref())
            .aggregate_masked(&losses, &mask, &[0, 1, 2])
            .unwrap();
        assert_eq!(stats.token_counts, vec![2, 1, 0]);
        assert_eq!(stats.sample_counts, vec![1, 1, 1]);
        assert_eq!(stats.domain_losses, vec![2.0, 4.0, 0.0]);

        assert!(matches!(
            DomainLossAggregator::new(3, parallel_context.dp_pg.as_ref()).aggregate_masked(
                &losses,
                &mask[..4],
                &[0, 1, 2]
            ),
            Err(DoReMiError::Shape(_))
        ));
    }

    #[test]
    fn domain_id_checks() {
        let parallel_context = ParallelContext::single();
        let losses = TokenLosses::filled(2, 3, 1.0);
        for domain_idxs in [&[0u16][..], &[0, 3][..]] {
            assert!(matches!(
                compute_per_domain_loss(&losses, domain_idxs, &context(3), &parallel_context),
                Err(DoReMiError::Shape(_))
            ));
        }
    }

    #[test]
    fn proxy_loss_needs_a_proxy_context() {
        let parallel_context = ParallelContext::single();
        let mut context =
            DoReMiContext::new(vec![1.0, 1.0], vec!["a".into(), "b".into()], false).unwrap();
        assert!(matches!(
            DoReMiLossForProxyTraining::new(&mut context, &parallel_context),
            Err(DoReMiError::Configuration(_))
        ));
    }

    #[test]
    fn lm_loss_weights_domain_losses() {
        let parallel_context = ParallelContext::single();
        let mut context = context(2);
        let losses = TokenLosses::from_rows(&[vec![3.0, 3.0], vec![1.0, 1.0]]).unwrap();
        let ref_losses = TokenLosses::filled(2, 2, 1.0);
        let output = DoReMiLossForProxyTraining::new(&mut context, &parallel_context)
            .unwrap()
            .forward(&losses, &ref_losses, &[0, 1])
            .unwrap();

        assert_eq!(output.domain_losses, vec![2.0, 0.0]);
        assert_eq!(output.samples_per_domain, vec![1, 1]);
        assert!(output.domain_weights[0] > output.domain_weights[1]);
        assert!((output.lm_loss - 2.0 * output.domain_weights[0]).abs() < 1e-6);
        assert_eq!(context.domain_weights(), output.domain_weights.as_slice());
    }

    #[test]
    fn single_shard_cross_entropy_matches_log_softmax() {
        let pg = tessera_parallel::SingleProcessGroup::new("tp_pg");
        let logits = ShardedLogits::new(1, 3, 1, vec![1.0, 2.0, 3.0]).unwrap();
        let loss = sharded_cross_entropy(&logits, &[2], &pg).unwrap();
        let expected = (1f32.exp() + 2f32.exp() + 3f32.exp()).ln() - 3.0;
        assert!((loss[0] - expected).abs() < 1e-5);

        assert!(sharded_cross_entropy(&logits, &[3], &pg).is_err());
    }
}
