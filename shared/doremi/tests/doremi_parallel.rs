use pretty_assertions::assert_eq;
use tessera_doremi::{
    compute_per_domain_loss, sharded_cross_entropy, CrossEntropyWithPerDomainLoss,
    DoReMiContext, DoReMiError, DoReMiLossForProxyTraining, ShardedLogits, TokenLosses,
};
use tessera_parallel::{LocalCluster, ParallelContext, ParallelismConfig};

const BATCH_SIZE: usize = 4;
const SEQ_LEN: usize = 8;
const NUM_DOMAINS: usize = 5;

fn domain_keys() -> Vec<String> {
    (0..NUM_DOMAINS).map(|i| format!("domain_{i}")).collect()
}

fn proxy_context() -> DoReMiContext {
    DoReMiContext::new(vec![1.0; NUM_DOMAINS], domain_keys(), true).unwrap()
}

/// Deterministic, rank-dependent inputs.
fn local_inputs(dp_rank: usize) -> (TokenLosses, TokenLosses, Vec<u16>) {
    let losses = (0..BATCH_SIZE * SEQ_LEN)
        .map(|i| ((i * 31 + dp_rank * 17) % 23) as f32 / 4.0)
        .collect();
    let ref_losses = (0..BATCH_SIZE * SEQ_LEN)
        .map(|i| ((i * 13 + dp_rank * 5) % 19) as f32 / 4.0)
        .collect();
    let domain_idxs = (0..BATCH_SIZE)
        .map(|row| ((row + dp_rank * 3) % NUM_DOMAINS) as u16)
        .collect();
    (
        TokenLosses::new(BATCH_SIZE, SEQ_LEN, losses).unwrap(),
        TokenLosses::new(BATCH_SIZE, SEQ_LEN, ref_losses).unwrap(),
        domain_idxs,
    )
}

fn dp_layouts() -> Vec<ParallelismConfig> {
    vec![
        ParallelismConfig::new(1, 1, 1),
        ParallelismConfig::new(1, 2, 1),
        ParallelismConfig::new(2, 2, 1),
        ParallelismConfig::new(1, 2, 2),
    ]
}

#[test]
fn proxy_loss_is_synced_across_data_parallel_ranks() {
    for layout in dp_layouts() {
        let cluster = LocalCluster::new(layout).unwrap();
        let outputs = cluster
            .run(|context| {
                let mut doremi = proxy_context();
                let (losses, ref_losses, domain_idxs) = local_inputs(context.dp_rank());
                let output = DoReMiLossForProxyTraining::new(&mut doremi, &context)?
                    .forward(&losses, &ref_losses, &domain_idxs)?;
                Ok(output)
            })
            .unwrap();

        // the global batch, in dp-rank order
        let mut sums = vec![0f64; NUM_DOMAINS];
        let mut tokens = vec![0u64; NUM_DOMAINS];
        for dp_rank in 0..layout.dp {
            let (losses, ref_losses, domain_idxs) = local_inputs(dp_rank);
            for (row, &domain) in domain_idxs.iter().enumerate() {
                for (loss, reference) in losses.row(row).iter().zip(ref_losses.row(row)) {
                    sums[domain as usize] += (loss - reference).max(0.0) as f64;
                }
                tokens[domain as usize] += SEQ_LEN as u64;
            }
        }

        let reference = &outputs[0];
        for output in &outputs {
            assert_eq!(output, reference, "{layout:?}");
            assert_eq!(
                output.excess_losses.shape(),
                [layout.dp * BATCH_SIZE, SEQ_LEN]
            );
            assert!(output.excess_losses.data().iter().all(|&x| x >= 0.0));
            assert_eq!(
                output.samples_per_domain.iter().sum::<u64>() as usize,
                layout.dp * BATCH_SIZE
            );
            for domain in 0..NUM_DOMAINS {
                let expected = if tokens[domain] == 0 {
                    0.0
                } else {
                    (sums[domain] / tokens[domain] as f64) as f32
                };
                assert!((output.domain_losses[domain] - expected).abs() < 1e-6);
            }
            assert!((output.domain_weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
            assert!(output.domain_weights.iter().all(|&w| w > 0.0));
        }
    }
}

#[test]
fn high_loss_domain_is_upweighted() {
    let parallel_context = ParallelContext::single();
    let mut context = proxy_context();
    let losses = TokenLosses::from_rows(&[
        vec![1.0; SEQ_LEN],
        vec![1.0; SEQ_LEN],
        vec![9.0; SEQ_LEN],
        vec![1.0; SEQ_LEN],
        vec![1.0; SEQ_LEN],
    ])
    .unwrap();
    let ref_losses = TokenLosses::filled(5, SEQ_LEN, 0.5);

    let output = DoReMiLossForProxyTraining::new(&mut context, &parallel_context)
        .unwrap()
        .forward(&losses, &ref_losses, &[0, 1, 2, 3, 4])
        .unwrap();

    let uniform = 1.0 / NUM_DOMAINS as f32;
    assert!(output.domain_weights[2] > uniform);
    for domain in [0, 1, 3, 4] {
        assert!(output.domain_weights[domain] < uniform);
        assert_eq!(output.domain_weights[domain], output.domain_weights[0]);
    }
    assert!((output.domain_weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    assert_eq!(context.domain_weights(), output.domain_weights.as_slice());
}

#[test]
fn diverging_weights_are_detected() {
    let cluster = LocalCluster::new(ParallelismConfig::new(1, 2, 1)).unwrap();
    let results = cluster.run_all(|context| {
        let mut weights = vec![1.0; NUM_DOMAINS];
        if context.dp_rank() == 1 {
            weights[0] = 2.0;
        }
        let mut doremi = DoReMiContext::new(weights, domain_keys(), true)?;
        let (losses, ref_losses, domain_idxs) = local_inputs(0);
        DoReMiLossForProxyTraining::new(&mut doremi, &context)?
            .forward(&losses, &ref_losses, &domain_idxs)?;
        Ok(())
    });

    for result in results {
        let err = result.unwrap_err();
        match err.downcast_ref::<DoReMiError>() {
            Some(DoReMiError::Synchronization(sync)) => {
                assert_eq!(sync.what, "domain weights");
                assert_eq!(sync.mismatched_ranks, vec![1]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

#[test]
fn per_domain_loss_over_two_replicas() {
    let cluster = LocalCluster::new(ParallelismConfig::new(1, 2, 1)).unwrap();
    let domain_losses = cluster
        .run(|context| {
            let doremi =
                DoReMiContext::new(vec![1.0; 3], domain_keys()[..3].to_vec(), false)?;
            // rank 0 only sees domain 0, rank 1 only domain 1
            let value = if context.dp_rank() == 0 { 2.0 } else { 6.0 };
            let losses = TokenLosses::filled(2, 3, value);
            let domain_idxs = vec![context.dp_rank() as u16; 2];
            Ok(compute_per_domain_loss(&losses, &domain_idxs, &doremi, &context)?)
        })
        .unwrap();
    assert_eq!(domain_losses[0], vec![2.0, 6.0, 0.0]);
    assert_eq!(domain_losses[0], domain_losses[1]);
}

fn reference_cross_entropy(full: &[f32], vocab_size: usize, targets: &[u32]) -> Vec<f32> {
    full.chunks_exact(vocab_size)
        .zip(targets)
        .map(|(row, &target)| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = row.iter().map(|x| (x - max).exp()).sum();
            sum.ln() - (row[target as usize] - max)
        })
        .collect()
}

#[test]
fn sharded_cross_entropy_matches_unsharded() {
    const NUM_TOKENS: usize = 6;
    const VOCAB_SIZE: usize = 12;
    let full: Vec<f32> = (0..NUM_TOKENS * VOCAB_SIZE)
        .map(|i| ((i * 37) % 29) as f32 / 7.0 - 2.0)
        .collect();
    let targets: Vec<u32> = (0..NUM_TOKENS).map(|t| ((t * 5) % VOCAB_SIZE) as u32).collect();
    let expected = reference_cross_entropy(&full, VOCAB_SIZE, &targets);

    for tp in [1, 2, 3, 4] {
        let cluster = LocalCluster::new(ParallelismConfig::new(tp, 1, 1)).unwrap();
        let per_rank = cluster
            .run(|context| {
                let logits = ShardedLogits::shard_of(
                    &full,
                    NUM_TOKENS,
                    VOCAB_SIZE,
                    context.tp_rank(),
                    context.tensor_parallel_size(),
                )?;
                Ok(sharded_cross_entropy(&logits, &targets, context.tp_pg.as_ref())?)
            })
            .unwrap();

        for losses in &per_rank {
            assert_eq!(losses, &per_rank[0], "tp={tp}");
            for (got, want) in losses.iter().zip(&expected) {
                assert!((got - want).abs() < 1e-5, "tp={tp}: {got} vs {want}");
            }
        }
    }
}

#[test]
fn cross_entropy_with_per_domain_loss() {
    const VOCAB_SIZE: usize = 4;
    let cluster = LocalCluster::new(ParallelismConfig::new(2, 1, 1)).unwrap();
    let full: Vec<f32> = vec![
        2.0, 0.0, 0.0, 0.0, //
        0.0, 2.0, 0.0, 0.0, //
        0.0, 0.0, 2.0, 0.0, //
        0.0, 0.0, 0.0, 2.0, //
    ];
    let label_ids = [0u32, 1, 0, 0];
    let label_mask = [true, true, true, false];
    let expected = reference_cross_entropy(&full, VOCAB_SIZE, &label_ids);

    let outputs = cluster
        .run(|context| {
            let doremi = DoReMiContext::new(vec![1.0, 1.0], domain_keys()[..2].to_vec(), false)?;
            let logits = ShardedLogits::shard_of(&full, 4, VOCAB_SIZE, context.tp_rank(), 2)?;
            Ok(CrossEntropyWithPerDomainLoss::new(&doremi, &context).forward(
                &logits,
                &label_ids,
                &label_mask,
                &[0, 1],
            )?)
        })
        .unwrap();

    let masked_mean = (expected[0] + expected[1] + expected[2]) / 3.0;
    for output in outputs {
        assert!((output.loss - masked_mean).abs() < 1e-5);
        assert!((output.domain_losses[0] - (expected[0] + expected[1]) / 2.0).abs() < 1e-5);
        // the masked token of row 1 is left out of domain 1's mean
        assert!((output.domain_losses[1] - expected[2]).abs() < 1e-5);
    }
}
