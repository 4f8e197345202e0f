//! Domain reweighting for proxy-model pretraining.
//!
//! A proxy model is trained on the excess of its per-token loss over a
//! reference model's. Excess losses are averaged per domain across the
//! data-parallel group and drive an exponentiated-gradient update of the domain
//! weights, which in turn weight the proxy's training loss and can be fed back
//! into dataset blending.

mod context;
mod error;
mod loss;
mod tensor;
mod weights;

pub use context::{DoReMiConfig, DoReMiContext};
pub use error::DoReMiError;
pub use loss::{
    compute_excess_losses, compute_per_domain_loss, sharded_cross_entropy, CrossEntropyOutput,
    CrossEntropyWithPerDomainLoss, DoReMiLossForProxyTraining, DoReMiProxyOutput,
    DomainLossAggregator, DomainLossStats,
};
pub use tensor::{ShardedLogits, TokenLosses};
pub use weights::WeightUpdater;
