use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default idle timeout applied to a proxy when its connector does not set one
pub const PROXY_TIMEOUT_DISCONNECTED_DEFAULT: Duration = Duration::from_secs(15);

/// Lifecycle status of an upstream proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Starting => "starting",
            ProxyStatus::Started => "started",
            ProxyStatus::Stopping => "stopping",
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Error => "error",
        }
    }

    /// Only started proxies may carry traffic
    pub fn is_usable(&self) -> bool {
        matches!(self, ProxyStatus::Started)
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Network address of a proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    pub hostname: String,
    pub port: u16,
}

impl Address {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// PEM certificate and key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePem {
    pub cert: String,
    pub key: String,
}

/// Cloud instance spawned by a connector; reached through CONNECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatacenterConfig {
    pub address: Address,
    /// Certificate shared with the instance for mutual TLS
    #[serde(default)]
    pub certificate: Option<CertificatePem>,
}

/// Credentialed gateway (residential, ISP, vendor endpoints)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidentialConfig {
    pub address: Address,
    pub username: String,
    pub password: String,
}

/// Wire protocol of a user-supplied proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// User-supplied ("free") or local proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    pub address: Address,
    #[serde(default)]
    pub auth: Option<ProxyAuth>,
}

/// Protocol-specific connection config of an upstream proxy
///
/// Proxies start as `Raw` (as reported by their connector) and are turned
/// into a typed variant by their transport's `complete_proxy_config`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyConfig {
    Raw(Value),
    Datacenter(DatacenterConfig),
    Residential(ResidentialConfig),
    Proxy(UserProxyConfig),
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig::Raw(Value::Null)
    }
}

/// Cumulative traffic counters for one upstream proxy
///
/// `requests` is derived from the valid and invalid counts, so the two
/// always reconcile.
#[derive(Debug, Default)]
pub struct ProxyCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests_valid: AtomicU64,
    requests_invalid: AtomicU64,
    last_used_ms: AtomicU64,
}

impl ProxyCounters {
    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_request(&self, valid: bool) {
        if valid {
            self.requests_valid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_invalid.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn touch(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_used_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let requests_valid = self.requests_valid.load(Ordering::Relaxed);
        let requests_invalid = self.requests_invalid.load(Ordering::Relaxed);
        CountersSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            requests: requests_valid + requests_invalid,
            requests_valid,
            requests_invalid,
        }
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a proxy's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CountersSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub requests: u64,
    pub requests_valid: u64,
    pub requests_invalid: u64,
}

/// A concrete upstream proxy the relay forwards traffic through
#[derive(Debug)]
pub struct UpstreamProxy {
    pub id: String,
    pub connector_id: String,
    pub key: String,
    pub project_id: String,
    pub transport_type: String,
    pub config: ProxyConfig,
    pub useragent: String,
    pub timeout_disconnected: Duration,
    status: RwLock<ProxyStatus>,
    counters: ProxyCounters,
}

impl UpstreamProxy {
    pub fn new(
        connector_id: impl Into<String>,
        key: impl Into<String>,
        project_id: impl Into<String>,
        transport_type: impl Into<String>,
        config: ProxyConfig,
    ) -> Self {
        let connector_id = connector_id.into();
        let key = key.into();
        Self {
            id: format_proxy_id(&connector_id, &key),
            connector_id,
            key,
            project_id: project_id.into(),
            transport_type: transport_type.into(),
            config,
            useragent: String::new(),
            timeout_disconnected: PROXY_TIMEOUT_DISCONNECTED_DEFAULT,
            status: RwLock::new(ProxyStatus::Starting),
            counters: ProxyCounters::default(),
        }
    }

    pub fn with_status(self, status: ProxyStatus) -> Self {
        *self.status.write() = status;
        self
    }

    pub fn status(&self) -> ProxyStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ProxyStatus) {
        *self.status.write() = status;
    }

    pub fn is_usable(&self) -> bool {
        self.status().is_usable()
    }

    pub fn counters(&self) -> &ProxyCounters {
        &self.counters
    }
}

/// Globally unique proxy id built from its connector and instance key
pub fn format_proxy_id(connector_id: &str, key: &str) -> String {
    format!("{}:{}", connector_id, key)
}

/// Counter deltas reported to the commander
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMetricsAdd {
    pub id: String,
    pub project_id: String,
    pub connector_id: String,
    pub requests: u64,
    pub requests_valid: u64,
    pub requests_invalid: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub reported_at: DateTime<Utc>,
}

impl ProxyMetricsAdd {
    pub fn empty(proxy: &UpstreamProxy) -> Self {
        Self {
            id: proxy.id.clone(),
            project_id: proxy.project_id.clone(),
            connector_id: proxy.connector_id.clone(),
            requests: 0,
            requests_valid: 0,
            requests_invalid: 0,
            bytes_received: 0,
            bytes_sent: 0,
            reported_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests == 0 && self.bytes_received == 0 && self.bytes_sent == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_proxy(key: &str) -> UpstreamProxy {
        UpstreamProxy::new("conn", key, "project", "datacenter", ProxyConfig::default())
    }

    #[test]
    fn test_proxy_id_format() {
        let proxy = create_test_proxy("i-1234");
        assert_eq!(proxy.id, "conn:i-1234");
        assert_eq!(format_proxy_id("a", "b"), "a:b");
    }

    #[test]
    fn test_proxy_status_usable() {
        assert!(ProxyStatus::Started.is_usable());
        assert!(!ProxyStatus::Starting.is_usable());
        assert!(!ProxyStatus::Stopping.is_usable());
        assert!(!ProxyStatus::Error.is_usable());

        let proxy = create_test_proxy("k").with_status(ProxyStatus::Started);
        assert!(proxy.is_usable());
        proxy.set_status(ProxyStatus::Stopped);
        assert!(!proxy.is_usable());
    }

    #[test]
    fn test_counters_reconcile() {
        let proxy = create_test_proxy("k");
        let counters = proxy.counters();

        counters.add_request(true);
        counters.add_request(true);
        counters.add_request(false);
        counters.add_sent(10);
        counters.add_received(25);

        let snap = counters.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.requests, snap.requests_valid + snap.requests_invalid);
        assert_eq!(snap.requests_invalid, 1);
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.bytes_received, 25);
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new("localhost", 8080).to_string(), "localhost:8080");
        assert_eq!(Address::new("::1", 8080).to_string(), "[::1]:8080");
    }

    #[test]
    fn test_user_proxy_config_deserialize() {
        let raw = serde_json::json!({
            "type": "socks5",
            "address": { "hostname": "10.0.0.1", "port": 1080 },
            "auth": { "username": "u", "password": "p" }
        });
        let config: UserProxyConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.proxy_type, ProxyType::Socks5);
        assert_eq!(config.address.port, 1080);
        assert_eq!(config.auth.unwrap().username, "u");
    }
}
