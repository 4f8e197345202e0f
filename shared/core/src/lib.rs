mod barrier;
mod random_seed;
mod sample_range;
mod token_size;

pub use barrier::{Barrier, CancellableBarrier, CancelledBarrier, NopBarrier};
pub use random_seed::RandomSeed;
pub use sample_range::SampleRange;
pub use token_size::{TokenSize, UnsupportedTokenSize};

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
