//! Fingerprint probe
//!
//! Asks a fingerprint endpoint, through an upstream proxy, which public IP
//! and location the proxy exits from.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION, USER_AGENT};
use hyper::{Method, Uri};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::config::FingerprintConfig;
use crate::error::{Result, RotorError};
use crate::models::{ProjectToConnect, UpstreamProxy};
use crate::proxy::fingerprint::CipherShuffler;
use crate::proxy::sockets::TunnelSocketSet;
use crate::proxy::transport::{send_request, Target, Transport};

/// What the fingerprint endpoint reports about an exit IP
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub ip: String,
    #[serde(default)]
    pub useragent: Option<String>,
    #[serde(default)]
    pub asn_name: Option<String>,
    #[serde(default)]
    pub asn_network: Option<String>,
    #[serde(default)]
    pub continent_code: Option<String>,
    #[serde(default)]
    pub continent_name: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub country_name: Option<String>,
    #[serde(default)]
    pub city_name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub url: Url,
    pub useragent: String,
    pub follow_redirect_max: u32,
    pub retry_max: u32,
    pub timeout: Duration,
}

impl ProbeOptions {
    /// Options for the configured endpoint, if any
    pub fn from_config(config: &FingerprintConfig) -> Option<Self> {
        config.url.clone().map(|url| Self {
            url,
            useragent: format!("rotor/{}", env!("CARGO_PKG_VERSION")),
            follow_redirect_max: config.follow_redirect_max,
            retry_max: config.retry_max,
            timeout: config.timeout,
        })
    }
}

/// TLS config for probing through `proxy_id`, the same one relayed traffic
/// of its project uses
pub fn fingerprint_tls(
    shuffler: &CipherShuffler,
    project: Option<&ProjectToConnect>,
    proxy_id: &str,
) -> Result<Arc<ClientConfig>> {
    match project {
        Some(project) => shuffler.client_config(project, proxy_id),
        None => Ok(shuffler.default_config()),
    }
}

enum Outcome {
    Fingerprint(Fingerprint),
    Redirect(String),
}

/// Fingerprint `proxy` through `transport`
///
/// Redirects are followed up to `follow_redirect_max` times; any other
/// failure is retried up to `retry_max` times.
#[instrument(skip_all, fields(proxy_id = %proxy.id))]
pub async fn fingerprint(
    transport: &dyn Transport,
    proxy: &UpstreamProxy,
    options: &ProbeOptions,
    tls: Arc<ClientConfig>,
) -> Result<Fingerprint> {
    let mut url = options.url.clone();
    let mut redirects_left = options.follow_redirect_max;
    let mut retries_left = options.retry_max;

    loop {
        match attempt(transport, proxy, &url, options, tls.clone()).await {
            Ok(Outcome::Fingerprint(fingerprint)) => {
                debug!(ip = %fingerprint.ip, "Proxy fingerprinted");
                return Ok(fingerprint);
            }
            Ok(Outcome::Redirect(location)) => {
                let next = url.join(&location)?;
                if next == url {
                    return Err(RotorError::transport("Cannot redirect to same location"));
                }
                if redirects_left == 0 {
                    return Err(RotorError::transport("Too many redirects"));
                }
                redirects_left -= 1;
                debug!(location = %next, "Following fingerprint redirect");
                url = next;
            }
            Err(e) if retries_left > 0 => {
                retries_left -= 1;
                debug!(retries_left, "Fingerprint attempt failed: {}", e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Probe URL carrying the proxy's identity and counters
fn probe_url(url: &Url, proxy: &UpstreamProxy) -> Url {
    let counters = proxy.counters().snapshot();
    let mut probe = url.clone();
    probe
        .query_pairs_mut()
        .append_pair("version", "2")
        .append_pair("mode", "connector")
        .append_pair("connectorType", &proxy.transport_type)
        .append_pair("proxyId", &proxy.id)
        .append_pair("requests", &counters.requests.to_string())
        .append_pair("requestsValid", &counters.requests_valid.to_string())
        .append_pair("requestsInvalid", &counters.requests_invalid.to_string())
        .append_pair("bytesReceived", &counters.bytes_received.to_string())
        .append_pair("bytesSent", &counters.bytes_sent.to_string());
    probe
}

async fn attempt(
    transport: &dyn Transport,
    proxy: &UpstreamProxy,
    url: &Url,
    options: &ProbeOptions,
    tls: Arc<ClientConfig>,
) -> Result<Outcome> {
    let uri: Uri = probe_url(url, proxy)
        .as_str()
        .parse()
        .map_err(|e| RotorError::InvalidRequest(format!("Invalid fingerprint URL: {}", e)))?;
    let target = Target::from_uri(&uri)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        HOST,
        HeaderValue::from_str(&target.host_header())
            .map_err(|e| RotorError::InvalidRequest(format!("Invalid host: {}", e)))?,
    );
    if let Ok(useragent) = HeaderValue::from_str(&options.useragent) {
        headers.insert(USER_AGENT, useragent);
    }

    // Dropped at the end of the attempt, closing whatever it opened
    let sockets = TunnelSocketSet::new(format!("fingerprint {}", proxy.id));
    let args = transport.build_fingerprint_request_args(
        &Method::GET,
        &target,
        headers,
        HeaderMap::new(),
        proxy,
        &sockets,
        options.timeout,
    )?;

    tokio::time::timeout(options.timeout, async {
        let connection = args.open(tls).await?;
        let request = args.build_request(Empty::<Bytes>::new())?;
        let response = send_request(connection, request).await?;

        let status = response.status().as_u16();
        if status > 300 && status < 400 {
            if let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
            {
                return Ok(Outcome::Redirect(location.to_string()));
            }
        }

        let body = response.into_body().collect().await?.to_bytes();
        if status != 200 {
            return Err(RotorError::upstream(
                status,
                format!(
                    "Get {} status code: {}",
                    status,
                    String::from_utf8_lossy(&body)
                ),
            ));
        }

        let fingerprint: Fingerprint = serde_json::from_slice(&body).map_err(|e| {
            RotorError::transport(format!("Invalid fingerprint response: {}", e))
        })?;
        Ok(Outcome::Fingerprint(fingerprint))
    })
    .await
    .map_err(|_| RotorError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::fingerprint::{cipher_digest, proxy_tls_config};
    use crate::proxy::test_support::spawn_upstream;
    use crate::proxy::transport::ProxyTransport;

    fn options(url: &str) -> ProbeOptions {
        ProbeOptions {
            url: Url::parse(url).unwrap(),
            useragent: "rotor/test".to_string(),
            follow_redirect_max: 2,
            retry_max: 1,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_fingerprint_tls_follows_project_shuffle() {
        let shuffler = CipherShuffler::new().unwrap();
        let default = cipher_digest(&shuffler.default_config());
        let mut project = crate::proxy::rotation::tests::project(Default::default());

        let plain = fingerprint_tls(&shuffler, Some(&project), "conn:a").unwrap();
        assert_eq!(cipher_digest(&plain), default);
        let orphan = fingerprint_tls(&shuffler, None, "conn:a").unwrap();
        assert_eq!(cipher_digest(&orphan), default);

        project.ciphers_shuffle = true;
        let shuffled = fingerprint_tls(&shuffler, Some(&project), "conn:a").unwrap();
        assert_ne!(cipher_digest(&shuffled), default);
        let relayed = shuffler.client_config(&project, "conn:a").unwrap();
        assert_eq!(cipher_digest(&shuffled), cipher_digest(&relayed));
    }

    #[test]
    fn test_probe_url_carries_identity() {
        let proxy = UpstreamProxy::new("dc", "7", "p1", "datacenter", Default::default());
        proxy.counters().add_request(true);
        let url = probe_url(&Url::parse("https://fp.example.com/api/json").unwrap(), &proxy);

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("mode".to_string(), "connector".to_string())));
        assert!(pairs.contains(&("connectorType".to_string(), "datacenter".to_string())));
        assert!(pairs.contains(&("proxyId".to_string(), "dc:7".to_string())));
        assert!(pairs.contains(&("requestsValid".to_string(), "1".to_string())));
    }

    #[test]
    fn test_options_require_url() {
        let mut config = FingerprintConfig {
            url: None,
            follow_redirect_max: 3,
            retry_max: 2,
            timeout: Duration::from_secs(5),
        };
        assert!(ProbeOptions::from_config(&config).is_none());

        config.url = Some(Url::parse("https://fp.example.com/").unwrap());
        let options = ProbeOptions::from_config(&config).unwrap();
        assert!(options.useragent.starts_with("rotor/"));
        assert_eq!(options.retry_max, 2);
    }

    #[tokio::test]
    async fn test_fingerprint_follows_redirect() {
        let upstream = spawn_upstream("alpha", None).await;
        let proxy = upstream.proxy("p1");

        let fingerprint = fingerprint(
            &ProxyTransport,
            &proxy,
            &options("http://fp.test/redirect"),
            proxy_tls_config(None).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(fingerprint.ip, "198.51.100.7");
        assert_eq!(fingerprint.country_code.as_deref(), Some("FR"));

        let seen = upstream.seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].uri.contains("proxyId=local%3Aalpha"));
        assert_eq!(seen[1].headers.get("user-agent").unwrap(), "rotor/test");
    }

    #[tokio::test]
    async fn test_fingerprint_retries_failed_attempt() {
        let upstream = spawn_upstream("alpha", None).await;
        let proxy = upstream.proxy("p1");

        let fingerprint = fingerprint(
            &ProxyTransport,
            &proxy,
            &options("http://fp.test/flaky"),
            proxy_tls_config(None).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(fingerprint.ip, "203.0.113.9");
        assert_eq!(upstream.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_fingerprint_refuses_redirect_loop() {
        let upstream = spawn_upstream("alpha", None).await;
        let proxy = upstream.proxy("p1");

        let err = fingerprint(
            &ProxyTransport,
            &proxy,
            &options("http://fp.test/loop"),
            proxy_tls_config(None).unwrap(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("same location"));
    }

    #[tokio::test]
    async fn test_fingerprint_reports_error_status() {
        let upstream = spawn_upstream("alpha", None).await;
        let proxy = upstream.proxy("p1");
        let mut options = options("http://fp.test/status/404");
        options.retry_max = 0;

        let err = fingerprint(&ProxyTransport, &proxy, &options, proxy_tls_config(None).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Get 404 status code"));
    }
}
