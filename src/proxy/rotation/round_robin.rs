//! Round-robin proxy selection strategy

use super::{Candidate, ProxySelector};

/// Cycles through the candidates, one step per resolution
pub struct RoundRobinSelector;

impl ProxySelector for RoundRobinSelector {
    fn select<'a>(
        &self,
        _token: &str,
        candidates: &'a [Candidate],
        tick: u64,
    ) -> Option<&'a Candidate> {
        if candidates.is_empty() {
            return None;
        }
        let idx = (tick % candidates.len() as u64) as usize;
        candidates.get(idx)
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
