//! Random proxy selection strategy

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use super::{Candidate, ProxySelector};

/// Selects a pseudo-random candidate
///
/// The generator is seeded from the project token and tick, so a given
/// resolution is reproducible.
pub struct RandomSelector;

fn seed(token: &str, tick: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(tick.to_be_bytes());
    hasher.finalize().into()
}

impl ProxySelector for RandomSelector {
    fn select<'a>(
        &self,
        token: &str,
        candidates: &'a [Candidate],
        tick: u64,
    ) -> Option<&'a Candidate> {
        let mut rng = StdRng::from_seed(seed(token, tick));
        candidates.choose(&mut rng)
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}
