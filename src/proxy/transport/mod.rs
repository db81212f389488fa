//! Transport layer for upstream proxy families
//!
//! A transport knows how one family of upstream proxies is reached: which
//! address to dial, whether to wrap the first hop in TLS, whether to issue a
//! `CONNECT` or a SOCKS handshake, and which credentials to inject. It turns
//! a target into a [`RequestArgs`] (forwarded requests) or a
//! [`ConnectArgs`] (blind tunnels) that the relay then opens.

mod datacenter;
mod dial;
mod proxy;
mod registry;
mod residential;
mod vendors;

pub use datacenter::DatacenterTransport;
pub use dial::{parse_connect_head, send_request, ConnectHead};
pub use proxy::ProxyTransport;
pub use registry::TransportRegistry;
pub use residential::ResidentialTransport;
pub use vendors::{IproyalTransport, NetnutTransport};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, Request, Uri};
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

use crate::error::{Result, RotorError};
use crate::models::{Address, ProxyConfig, UpstreamProxy};
use crate::proxy::sockets::TunnelSocketSet;

/// Trait for proxy connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream to an upstream or a target
pub type BoxedConnection = Box<dyn ProxyConnection>;

/// Upstream proxy families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Datacenter,
    Residential,
    Netnut,
    Iproyal,
    Proxy,
}

impl TransportKind {
    pub const ALL: [TransportKind; 5] = [
        TransportKind::Datacenter,
        TransportKind::Residential,
        TransportKind::Netnut,
        TransportKind::Iproyal,
        TransportKind::Proxy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datacenter => "datacenter",
            Self::Residential => "residential",
            Self::Netnut => "netnut",
            Self::Iproyal => "iproyal",
            Self::Proxy => "proxy",
        }
    }
}

impl FromStr for TransportKind {
    type Err = RotorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "datacenter" => Ok(Self::Datacenter),
            "residential" => Ok(Self::Residential),
            "netnut" => Ok(Self::Netnut),
            "iproyal" => Ok(Self::Iproyal),
            "proxy" => Ok(Self::Proxy),
            _ => Err(RotorError::TransportNotFound(s.to_string())),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Connector-level settings used to complete a proxy's config
#[derive(Debug, Clone, Default)]
pub struct ConnectorContext {
    pub connector_id: String,
    pub connector_config: Value,
    pub credential_config: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Destination of a relayed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
}

/// Error for a request URI whose scheme cannot be relayed
pub fn unsupported_scheme(scheme: &str) -> RotorError {
    RotorError::UnsupportedProtocol(format!(
        "{}: is not supported, only http: and https: can be relayed",
        scheme.to_ascii_lowercase()
    ))
}

impl Target {
    /// Parse an absolute request URI. Anything but http/https is refused.
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(other) => return Err(unsupported_scheme(other)),
            None => {
                return Err(RotorError::InvalidRequest(format!(
                    "URL must be absolute: {}",
                    uri
                )))
            }
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RotorError::InvalidRequest("Missing host in URI".to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let port = uri.port_u16().unwrap_or(match scheme {
            Scheme::Https => 443,
            Scheme::Http => 80,
        });

        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .filter(|pq| !pq.is_empty())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            scheme,
            host,
            port,
            path_and_query,
        })
    }

    /// Target of a request decrypted inside a MITM session
    pub fn in_tunnel(host: &str, port: u16, uri: &Uri) -> Self {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .filter(|pq| !pq.is_empty())
            .unwrap_or_else(|| "/".to_string());
        Self {
            scheme: Scheme::Https,
            host: host.to_string(),
            port,
            path_and_query,
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    fn default_port(&self) -> u16 {
        match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    fn host_literal(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host:port`, as used on a CONNECT line
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host_literal(), self.port)
    }

    /// Value of the `Host` header
    pub fn host_header(&self) -> String {
        if self.port == self.default_port() {
            self.host_literal()
        } else {
            self.authority()
        }
    }

    pub fn absolute_url(&self) -> String {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        format!("{}://{}{}", scheme, self.host_header(), self.path_and_query)
    }
}

/// Parse host and port from authority (for CONNECT requests)
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| RotorError::InvalidRequest("Invalid authority".to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| RotorError::InvalidRequest("Invalid port".to_string()))?,
            None => 443,
        };
        return Ok((host.to_string(), port));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| RotorError::InvalidRequest("Invalid port".to_string()))?;
        if host.is_empty() {
            return Err(RotorError::InvalidRequest("Missing host".to_string()));
        }
        Ok((host.to_string(), port))
    } else if authority.is_empty() {
        Err(RotorError::InvalidRequest("Missing host".to_string()))
    } else {
        // Default to port 443 for CONNECT (typically HTTPS)
        Ok((authority.to_string(), 443))
    }
}

/// TLS wrapped around the first hop (client to proxy)
#[derive(Clone)]
pub struct ProxyTls {
    pub server_name: String,
    pub config: Arc<ClientConfig>,
}

impl std::fmt::Debug for ProxyTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTls")
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Where the first hop goes
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub address: Address,
    pub tls: Option<ProxyTls>,
}

impl Endpoint {
    pub fn plain(address: Address) -> Self {
        Self { address, tls: None }
    }
}

/// CONNECT issued to the proxy before anything else
#[derive(Debug, Clone)]
pub struct ConnectStep {
    pub authority: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

#[derive(Debug, Clone)]
pub struct SocksStep {
    pub version: SocksVersion,
    pub credentials: Option<(String, String)>,
    pub host: String,
    pub port: u16,
}

/// What happens on the first hop once it is open
#[derive(Debug, Clone)]
pub enum Route {
    /// The proxy receives an absolute-form request
    Forward,
    Connect(ConnectStep),
    Socks(SocksStep),
}

/// Concrete instructions for one forwarded request
#[derive(Debug, Clone)]
pub struct RequestArgs {
    pub method: Method,
    pub endpoint: Endpoint,
    pub route: Route,
    pub target: Target,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub sockets: TunnelSocketSet,
    /// Header the upstream uses to explain a refused CONNECT
    pub error_header: Option<&'static str>,
}

impl RequestArgs {
    /// TLS to the target is needed once the route reaches it directly
    pub fn tls_to_target(&self) -> bool {
        self.target.is_https() && !matches!(self.route, Route::Forward)
    }

    /// Absolute-form for forward proxying, origin-form otherwise
    pub fn request_uri(&self) -> String {
        match self.route {
            Route::Forward => self.target.absolute_url(),
            _ => self.target.path_and_query.clone(),
        }
    }

    /// Open the stream the request will be written to
    #[instrument(skip(self, target_tls), fields(target = %self.target.authority(), proxy = %self.endpoint.address))]
    pub async fn open(&self, target_tls: Arc<ClientConfig>) -> Result<BoxedConnection> {
        let stream = dial::establish(
            &self.endpoint,
            &self.route,
            &self.sockets,
            self.timeout,
            self.error_header,
        )
        .await?;

        if self.tls_to_target() {
            debug!("Starting TLS with target");
            dial::tls_connect(stream, &self.target.host, target_tls, self.timeout).await
        } else {
            Ok(stream)
        }
    }

    /// Build the outbound request around `body`
    pub fn build_request<B>(&self, body: B) -> Result<Request<B>> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.request_uri())
            .body(body)
            .map_err(|e| RotorError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let headers = request.headers_mut();
        headers.extend(self.headers.clone());
        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&self.target.host_header())
                .map_err(|e| RotorError::InvalidRequest(format!("Invalid host: {}", e)))?;
            headers.insert(HOST, host);
        }

        Ok(request)
    }
}

/// Concrete instructions for one blind tunnel
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub endpoint: Endpoint,
    pub route: Route,
    pub timeout: Duration,
    pub sockets: TunnelSocketSet,
    pub error_header: Option<&'static str>,
}

impl ConnectArgs {
    /// Open the tunnel; bytes written afterwards reach the target as-is
    pub async fn open(&self) -> Result<BoxedConnection> {
        dial::establish(
            &self.endpoint,
            &self.route,
            &self.sockets,
            self.timeout,
            self.error_header,
        )
        .await
    }
}

/// Trait for upstream proxy families
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Fill protocol fields of a freshly reported proxy. Performs no I/O.
    fn complete_proxy_config(
        &self,
        proxy: &mut UpstreamProxy,
        connector: &ConnectorContext,
    ) -> Result<()>;

    /// Describe how to forward one request through `proxy`
    #[allow(clippy::too_many_arguments)]
    fn build_request_args(
        &self,
        method: &Method,
        target: &Target,
        headers: HeaderMap,
        connect_headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<RequestArgs>;

    /// Same as [`Transport::build_request_args`] for fingerprint probes
    #[allow(clippy::too_many_arguments)]
    fn build_fingerprint_request_args(
        &self,
        method: &Method,
        target: &Target,
        headers: HeaderMap,
        connect_headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<RequestArgs> {
        self.build_request_args(
            method,
            target,
            headers,
            connect_headers,
            proxy,
            sockets,
            timeout,
        )
    }

    /// Describe how to open a blind tunnel to `authority`
    fn build_connect_args(
        &self,
        authority: &str,
        headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<ConnectArgs>;

    /// Open a blind tunnel to `authority` through `proxy`
    async fn connect(
        &self,
        authority: &str,
        headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<BoxedConnection> {
        let args = self.build_connect_args(authority, headers, proxy, sockets, timeout)?;
        args.open().await
    }
}

/// `Proxy-Authorization` value for Basic credentials
pub(crate) fn basic_auth(username: &str, password: &str) -> Result<HeaderValue> {
    let encoded = BASE64.encode(format!("{}:{}", username, password));
    HeaderValue::from_str(&format!("Basic {}", encoded))
        .map_err(|e| RotorError::InvalidConfig(format!("Invalid proxy credentials: {}", e)))
}

/// Deserialize a proxy's raw connector config into `T`
pub(crate) fn parse_raw_config<T: DeserializeOwned>(
    proxy: &UpstreamProxy,
    value: &Value,
) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| {
        RotorError::InvalidConfig(format!("Invalid config for proxy {}: {}", proxy.id, e))
    })
}

/// Error for a proxy whose config does not belong to the transport
pub(crate) fn config_mismatch(proxy: &UpstreamProxy, kind: TransportKind) -> RotorError {
    let found = match &proxy.config {
        ProxyConfig::Raw(_) => "raw",
        ProxyConfig::Datacenter(_) => "datacenter",
        ProxyConfig::Residential(_) => "residential",
        ProxyConfig::Proxy(_) => "proxy",
    };
    RotorError::InvalidConfig(format!(
        "Proxy {} has a {} config, expected {}",
        proxy.id, found, kind
    ))
}
