use crate::error::{Result, RotorError};
use hyper::header::HeaderName;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay listener and connection handling
    pub relay: RelayConfig,
    /// Metrics flushing
    pub metrics: MetricsConfig,
    /// Fingerprint probe
    pub fingerprint: FingerprintConfig,
    /// JSON inventory of projects and proxies
    pub inventory: Option<String>,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port for the relay (default: 8888)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Upper bound for reaching an upstream, CONNECT and TLS included
    pub connect_timeout: Duration,
    /// Idle timeout for proxies that do not set their own
    pub idle_timeout: Duration,
    /// Lifetime of generated MITM certificates
    pub cert_duration: Duration,
    /// Keep a server-wide registry of open sockets
    pub track_sockets: bool,
    /// Response header carrying the cipher digest of MITM exchanges
    pub fingerprint_header: Option<HeaderName>,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub flush_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    /// Endpoint answering with the caller's public IP and geo data
    pub url: Option<Url>,
    pub follow_redirect_max: u32,
    pub retry_max: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            relay: RelayConfig {
                port: get_env_or("RELAY_PORT", "8888").parse().map_err(|_| {
                    RotorError::InvalidConfig("RELAY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("RELAY_HOST", "0.0.0.0"),
                connect_timeout: Duration::from_millis(parse_env(
                    "RELAY_CONNECT_TIMEOUT_MS",
                    10_000,
                )?),
                idle_timeout: Duration::from_millis(parse_env("RELAY_IDLE_TIMEOUT_MS", 15_000)?),
                cert_duration: Duration::from_secs(parse_env(
                    "RELAY_CERT_DURATION_SECS",
                    30 * 24 * 3600,
                )?),
                track_sockets: parse_env("ROTOR_TRACK_SOCKETS", true)?,
                fingerprint_header: parse_header_name("ROTOR_FINGERPRINT_HEADER")?,
            },
            metrics: MetricsConfig {
                flush_interval: Duration::from_millis(parse_env(
                    "ROTOR_METRICS_FLUSH_MS",
                    10_000,
                )?),
            },
            fingerprint: FingerprintConfig {
                url: parse_url("ROTOR_FINGERPRINT_URL")?,
                follow_redirect_max: parse_env("ROTOR_FINGERPRINT_FOLLOW_REDIRECT_MAX", 3)?,
                retry_max: parse_env("ROTOR_FINGERPRINT_RETRY_MAX", 2)?,
                timeout: Duration::from_millis(parse_env(
                    "ROTOR_FINGERPRINT_TIMEOUT_MS",
                    10_000,
                )?),
            },
            inventory: env::var("ROTOR_INVENTORY")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the relay address
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            RotorError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))
        }),
        _ => Ok(default),
    }
}

fn parse_header_name(key: &str) -> Result<Option<HeaderName>> {
    let raw = env::var(key).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    HeaderName::from_bytes(raw.to_ascii_lowercase().as_bytes())
        .map(Some)
        .map_err(|_| RotorError::InvalidConfig(format!("{} must be a valid header name", key)))
}

fn parse_url(key: &str) -> Result<Option<Url>> {
    let raw = env::var(key).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(raw)
        .map_err(|e| RotorError::InvalidConfig(format!("{} must be a valid URL: {}", key, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(Some(url)),
        other => Err(RotorError::InvalidConfig(format!(
            "{} has unsupported scheme: {}",
            key, other
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
