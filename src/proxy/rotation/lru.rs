//! Least recently used proxy selection strategy

use super::{Candidate, ProxySelector};

/// Picks the candidate that has gone longest without a connection
pub struct LeastRecentlyUsedSelector;

impl ProxySelector for LeastRecentlyUsedSelector {
    fn select<'a>(
        &self,
        _token: &str,
        candidates: &'a [Candidate],
        _tick: u64,
    ) -> Option<&'a Candidate> {
        let mut best: Option<&Candidate> = None;
        for candidate in candidates {
            match best {
                Some(current) if candidate.last_used_ms >= current.last_used_ms => {}
                _ => best = Some(candidate),
            }
        }
        best
    }

    fn strategy_name(&self) -> &'static str {
        "least_recently_used"
    }
}
