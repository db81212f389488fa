//! Session and stickiness resolution
//!
//! Decides which upstream proxy carries a connection: the client's sticky
//! proxy when it is still usable, otherwise one picked by the project's
//! rotation policy.

mod least_conn;
mod lru;
mod random;
mod round_robin;

pub use least_conn::LeastConnectionsSelector;
pub use lru::LeastRecentlyUsedSelector;
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::commander::Commander;
use crate::error::{Result, RotorError};
use crate::models::{ProjectStatus, ProjectToConnect, UpstreamProxy};

/// Policy used when no sticky proxy applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
    #[default]
    RoundRobin,
    #[serde(alias = "lru")]
    LeastRecentlyUsed,
    #[serde(alias = "least_conn")]
    LeastConnections,
    Random,
}

impl RotationPolicy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "least_recently_used" | "leastrecentlyused" | "least-recently-used" | "lru" => {
                Self::LeastRecentlyUsed
            }
            "least_connections" | "leastconnections" | "least-connections" | "least_conn" => {
                Self::LeastConnections
            }
            "random" => Self::Random,
            _ => Self::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastRecentlyUsed => "least_recently_used",
            Self::LeastConnections => "least_connections",
            Self::Random => "random",
        }
    }
}

/// A live proxy considered for one connection
#[derive(Debug, Clone)]
pub struct Candidate {
    pub proxy: Arc<UpstreamProxy>,
    pub active_connections: usize,
    pub last_used_ms: u64,
}

/// Outcome of a resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    pub proxy: Arc<UpstreamProxy>,
    /// The client named a sticky proxy that could not be honoured
    pub reassigned: bool,
}

/// Trait for proxy selection strategies
///
/// Implementations pick among already-eligible candidates and hold no state;
/// `tick` advances once per resolution of the project.
pub trait ProxySelector: Send + Sync {
    fn select<'a>(&self, token: &str, candidates: &'a [Candidate], tick: u64)
        -> Option<&'a Candidate>;

    fn strategy_name(&self) -> &'static str;
}

/// Create a proxy selector based on the policy
pub fn create_selector(policy: RotationPolicy) -> Box<dyn ProxySelector> {
    match policy {
        RotationPolicy::RoundRobin => Box::new(RoundRobinSelector),
        RotationPolicy::LeastRecentlyUsed => Box::new(LeastRecentlyUsedSelector),
        RotationPolicy::LeastConnections => Box::new(LeastConnectionsSelector),
        RotationPolicy::Random => Box::new(RandomSelector),
    }
}

fn is_eligible(candidate: &Candidate, limit: Option<usize>) -> bool {
    candidate.proxy.is_usable() && limit.map_or(true, |max| candidate.active_connections < max)
}

/// Pick the upstream proxy for one connection of `project`
pub fn resolve(
    project: &ProjectToConnect,
    sticky_hint: Option<&str>,
    candidates: &[Candidate],
    tick: u64,
) -> Result<Resolution> {
    let limit = project.max_connections_per_proxy;

    if let Some(hint) = sticky_hint {
        if let Some(candidate) = candidates
            .iter()
            .find(|c| c.proxy.id == hint && is_eligible(c, limit))
        {
            return Ok(Resolution {
                proxy: candidate.proxy.clone(),
                reassigned: false,
            });
        }
    }

    let eligible: Vec<Candidate> = candidates
        .iter()
        .filter(|c| is_eligible(c, limit))
        .cloned()
        .collect();

    let selector = create_selector(project.rotation);
    let chosen = selector
        .select(&project.token, &eligible, tick)
        .ok_or_else(|| RotorError::NoProxyAvailable {
            project_id: project.id.clone(),
        })?;

    Ok(Resolution {
        proxy: chosen.proxy.clone(),
        reassigned: sticky_hint.is_some(),
    })
}

/// Connection tracker for proxies
///
/// Counts active connections per proxy id for least-connections selection
/// and the per-proxy connection cap.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: DashMap<String, usize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn acquire(&self, proxy_id: &str) {
        self.connections
            .entry(proxy_id.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    /// Take a slot on `proxy_id` unless it already holds `limit` connections
    ///
    /// The check and the increment happen under the entry's lock.
    pub fn try_acquire(&self, proxy_id: &str, limit: Option<usize>) -> bool {
        let mut count = self.connections.entry(proxy_id.to_string()).or_insert(0);
        if limit.is_some_and(|max| *count >= max) {
            return false;
        }
        *count += 1;
        true
    }

    pub fn release(&self, proxy_id: &str) {
        self.connections.entry(proxy_id.to_string()).and_modify(|c| {
            if *c > 0 {
                *c -= 1;
            }
        });
    }

    pub fn get(&self, proxy_id: &str) -> usize {
        self.connections.get(proxy_id).map(|v| *v).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.connections.clear();
    }
}

/// Guard for tracking an active connection on a proxy
pub struct ConnectionGuard {
    proxy_id: String,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionGuard {
    /// Guard for a slot under `limit`, `None` when the proxy is full
    pub fn try_new(
        proxy_id: &str,
        tracker: Arc<ConnectionTracker>,
        limit: Option<usize>,
    ) -> Option<Self> {
        if !tracker.try_acquire(proxy_id, limit) {
            return None;
        }
        Some(Self {
            proxy_id: proxy_id.to_string(),
            tracker,
        })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.proxy_id);
    }
}

/// Resolver state shared by every connection
pub struct SessionResolver {
    commander: Arc<dyn Commander>,
    ticks: DashMap<String, AtomicU64>,
    tracker: Arc<ConnectionTracker>,
}

impl SessionResolver {
    pub fn new(commander: Arc<dyn Commander>) -> Self {
        Self {
            commander,
            ticks: DashMap::new(),
            tracker: Arc::new(ConnectionTracker::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    fn next_tick(&self, project_id: &str) -> u64 {
        if let Some(tick) = self.ticks.get(project_id) {
            return tick.fetch_add(1, Ordering::Relaxed);
        }
        self.ticks
            .entry(project_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Ask for more capacity when a calm project receives traffic
    async fn wake_up(&self, project: &ProjectToConnect) {
        if project.auto_scale_up && project.status == ProjectStatus::Calm {
            info!(project_id = %project.id, "Scaling up project on incoming traffic");
            if let Err(e) = self.commander.scale_up_project(&project.id).await {
                warn!(project_id = %project.id, error = %e, "Scale up request failed");
            }
        }
    }

    /// Resolve the proxy for one connection and count it as active until the
    /// returned guard drops
    #[instrument(skip(self, project), fields(project_id = %project.id))]
    pub async fn resolve(
        &self,
        project: &ProjectToConnect,
        sticky_hint: Option<&str>,
    ) -> Result<(Resolution, ConnectionGuard)> {
        if !project.is_active() {
            return Err(RotorError::ProjectInactive {
                project_id: project.id.clone(),
            });
        }

        self.wake_up(project).await;

        let proxies = self.commander.get_proxies_to_connect(&project.id).await?;
        let limit = project.max_connections_per_proxy;
        let tick = self.next_tick(&project.id);

        // A proxy picked from a stale count may fill up before its slot is
        // taken; pick again with fresh counts.
        let mut attempts = proxies.len().max(1);
        let outcome = loop {
            let candidates: Vec<Candidate> = proxies
                .iter()
                .map(|proxy| Candidate {
                    active_connections: self.tracker.get(&proxy.id),
                    last_used_ms: proxy.counters().last_used_ms(),
                    proxy: proxy.clone(),
                })
                .collect();

            let resolution = match resolve(project, sticky_hint, &candidates, tick) {
                Ok(resolution) => resolution,
                Err(e) => break Err(e),
            };
            match ConnectionGuard::try_new(&resolution.proxy.id, self.tracker.clone(), limit) {
                Some(guard) => break Ok((resolution, guard)),
                None => {
                    debug!(proxy_id = %resolution.proxy.id, "Proxy filled up, picking again");
                    attempts -= 1;
                    if attempts == 0 {
                        break Err(RotorError::NoProxyAvailable {
                            project_id: project.id.clone(),
                        });
                    }
                }
            }
        };

        match outcome {
            Ok((resolution, guard)) => {
                resolution.proxy.counters().touch();
                if resolution.reassigned {
                    debug!(
                        proxy_id = %resolution.proxy.id,
                        "Sticky proxy unavailable, reassigned"
                    );
                }
                Ok((resolution, guard))
            }
            Err(RotorError::NoProxyAvailable { project_id }) if project.auto_scale_up => {
                if project.status != ProjectStatus::Calm {
                    if let Err(e) = self.commander.scale_up_project(&project_id).await {
                        warn!(project_id = %project_id, error = %e, "Scale up request failed");
                    }
                }
                Err(RotorError::ScalingUp { project_id })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::commander::InMemoryCommander;
    use crate::models::{ProxyConfig, ProxyStatus};

    pub(crate) fn started_proxy(key: &str) -> Arc<UpstreamProxy> {
        Arc::new(
            UpstreamProxy::new("conn", key, "p1", "proxy", ProxyConfig::default())
                .with_status(ProxyStatus::Started),
        )
    }

    pub(crate) fn candidate(proxy: Arc<UpstreamProxy>, active: usize, last_used: u64) -> Candidate {
        Candidate {
            proxy,
            active_connections: active,
            last_used_ms: last_used,
        }
    }

    pub(crate) fn project(policy: RotationPolicy) -> ProjectToConnect {
        ProjectToConnect {
            id: "p1".to_string(),
            name: "project".to_string(),
            token: "token".to_string(),
            status: ProjectStatus::Hot,
            mitm: false,
            certificate: None,
            ciphers_shuffle: false,
            auto_scale_up: false,
            cookie_session: false,
            useragent_override: false,
            rotation: policy,
            max_connections_per_proxy: None,
        }
    }

    #[test]
    fn test_rotation_policy_from_str() {
        assert_eq!(RotationPolicy::from_str("random"), RotationPolicy::Random);
        assert_eq!(
            RotationPolicy::from_str("round-robin"),
            RotationPolicy::RoundRobin
        );
        assert_eq!(
            RotationPolicy::from_str("least_conn"),
            RotationPolicy::LeastConnections
        );
        assert_eq!(
            RotationPolicy::from_str("LRU"),
            RotationPolicy::LeastRecentlyUsed
        );
        assert_eq!(
            RotationPolicy::from_str("unknown"),
            RotationPolicy::RoundRobin
        );
    }

    #[test]
    fn test_rotation_policy_serde() {
        let policy: RotationPolicy = serde_json::from_str("\"least_recently_used\"").unwrap();
        assert_eq!(policy, RotationPolicy::LeastRecentlyUsed);
        let policy: RotationPolicy = serde_json::from_str("\"least_conn\"").unwrap();
        assert_eq!(policy, RotationPolicy::LeastConnections);
        assert_eq!(
            serde_json::to_string(&RotationPolicy::RoundRobin).unwrap(),
            "\"round_robin\""
        );
    }

    #[test]
    fn test_create_selector_strategy_name() {
        for policy in [
            RotationPolicy::RoundRobin,
            RotationPolicy::LeastRecentlyUsed,
            RotationPolicy::LeastConnections,
            RotationPolicy::Random,
        ] {
            assert_eq!(create_selector(policy).strategy_name(), policy.as_str());
        }
    }

    #[test]
    fn test_sticky_hint_reused() {
        let a = started_proxy("a");
        let b = started_proxy("b");
        let candidates = vec![candidate(a, 0, 0), candidate(b, 0, 0)];

        for tick in 0..4 {
            let res = resolve(
                &project(RotationPolicy::RoundRobin),
                Some("conn:b"),
                &candidates,
                tick,
            )
            .unwrap();
            assert_eq!(res.proxy.id, "conn:b");
            assert!(!res.reassigned);
        }
    }

    #[test]
    fn test_stale_sticky_hint_reassigned() {
        let a = started_proxy("a");
        let b = started_proxy("b");
        b.set_status(ProxyStatus::Stopping);
        let candidates = vec![candidate(a, 0, 0), candidate(b, 0, 0)];
        let project = project(RotationPolicy::RoundRobin);

        let res = resolve(&project, Some("conn:b"), &candidates, 1).unwrap();
        assert_eq!(res.proxy.id, "conn:a");
        assert!(res.reassigned);

        let res = resolve(&project, Some("conn:gone"), &candidates, 0).unwrap();
        assert_eq!(res.proxy.id, "conn:a");
        assert!(res.reassigned);

        let res = resolve(&project, None, &candidates, 0).unwrap();
        assert!(!res.reassigned);
    }

    #[test]
    fn test_saturated_proxy_skipped() {
        let a = started_proxy("a");
        let b = started_proxy("b");
        let candidates = vec![candidate(a, 2, 0), candidate(b, 0, 0)];
        let mut project = project(RotationPolicy::RoundRobin);
        project.max_connections_per_proxy = Some(2);

        let res = resolve(&project, Some("conn:a"), &candidates, 0).unwrap();
        assert_eq!(res.proxy.id, "conn:b");
        assert!(res.reassigned);
    }

    #[test]
    fn test_no_candidates() {
        let project = project(RotationPolicy::Random);
        let err = resolve(&project, None, &[], 0).unwrap_err();
        assert!(matches!(err, RotorError::NoProxyAvailable { .. }));

        let stopped = started_proxy("a");
        stopped.set_status(ProxyStatus::Stopped);
        let err = resolve(&project, None, &[candidate(stopped, 0, 0)], 0).unwrap_err();
        assert!(matches!(err, RotorError::NoProxyAvailable { .. }));
    }

    #[test]
    fn test_connection_tracker_counts() {
        let tracker = Arc::new(ConnectionTracker::new());

        assert_eq!(tracker.get("a"), 0);
        tracker.acquire("a");
        tracker.acquire("a");
        assert_eq!(tracker.get("a"), 2);

        tracker.release("a");
        assert_eq!(tracker.get("a"), 1);

        tracker.release("a");
        tracker.release("a");
        assert_eq!(tracker.get("a"), 0);

        {
            let _guard = ConnectionGuard::try_new("a", tracker.clone(), None).unwrap();
            assert_eq!(tracker.get("a"), 1);
        }
        assert_eq!(tracker.get("a"), 0);

        tracker.acquire("a");
        tracker.clear();
        assert_eq!(tracker.get("a"), 0);
    }

    #[test]
    fn test_try_acquire_stops_at_limit() {
        let tracker = Arc::new(ConnectionTracker::new());
        assert!(tracker.try_acquire("a", Some(2)));
        assert!(tracker.try_acquire("a", Some(2)));
        assert!(!tracker.try_acquire("a", Some(2)));
        assert_eq!(tracker.get("a"), 2);
        assert!(tracker.try_acquire("a", None));

        assert!(ConnectionGuard::try_new("b", tracker.clone(), Some(0)).is_none());
        assert_eq!(tracker.get("b"), 0);
        {
            let _guard = ConnectionGuard::try_new("b", tracker.clone(), Some(1)).unwrap();
            assert!(ConnectionGuard::try_new("b", tracker.clone(), Some(1)).is_none());
        }
        assert_eq!(tracker.get("b"), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let tracker = Arc::new(ConnectionTracker::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| tracker.try_acquire("a", Some(5)))
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(granted, 5);
        assert_eq!(tracker.get("a"), 5);
    }

    #[tokio::test]
    async fn test_resolver_respects_cap_under_concurrency() {
        let commander = Arc::new(InMemoryCommander::new());
        commander.add_proxy(started_proxy("a"));
        commander.add_proxy(started_proxy("b"));
        let mut project = project(RotationPolicy::LeastConnections);
        project.max_connections_per_proxy = Some(3);
        let resolver = Arc::new(SessionResolver::new(commander));

        let attempts: Vec<_> = (0..20)
            .map(|_| {
                let resolver = resolver.clone();
                let project = project.clone();
                tokio::spawn(async move { resolver.resolve(&project, None).await })
            })
            .collect();

        let mut guards = Vec::new();
        let mut refused = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok((_, guard)) => guards.push(guard),
                Err(RotorError::NoProxyAvailable { .. }) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(guards.len(), 6);
        assert_eq!(refused, 14);
        assert_eq!(resolver.tracker().get("conn:a"), 3);
        assert_eq!(resolver.tracker().get("conn:b"), 3);
        drop(guards);
        assert_eq!(resolver.tracker().get("conn:a"), 0);
    }
}
