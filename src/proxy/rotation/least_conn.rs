//! Least connections proxy selection strategy

use super::{Candidate, ProxySelector};

/// Picks the candidate with the fewest active connections
///
/// Ties go to the earliest candidate in the list.
pub struct LeastConnectionsSelector;

impl ProxySelector for LeastConnectionsSelector {
    fn select<'a>(
        &self,
        _token: &str,
        candidates: &'a [Candidate],
        _tick: u64,
    ) -> Option<&'a Candidate> {
        let mut best: Option<&Candidate> = None;
        for candidate in candidates {
            match best {
                Some(current) if candidate.active_connections >= current.active_connections => {}
                _ => best = Some(candidate),
            }
        }
        best
    }

    fn strategy_name(&self) -> &'static str {
        "least_connections"
    }
}
