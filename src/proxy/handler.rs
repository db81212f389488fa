//! Relay engine
//!
//! Turns one client request into one upstream exchange: authenticate the
//! token, resolve the upstream proxy, build the transport descriptor, then
//! stream. `CONNECT` requests either become a blind tunnel or a MITM session
//! (see [`crate::proxy::mitm`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE, RETRY_AFTER,
    SET_COOKIE, USER_AGENT,
};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::commander::Commander;
use crate::config::RelayConfig;
use crate::error::{Result, RotorError};
use crate::models::{ConnectMode, ProjectToConnect, UpstreamProxy};
use crate::proxy::certificate::MitmCertCache;
use crate::proxy::fingerprint::CipherShuffler;
use crate::proxy::headers::{
    expired_session_cookies, parse_domain, sanitize_header_value, session_cookies,
    strip_internal_cookies, strip_internal_headers, take_sticky_hint, HEADER_MODE,
    HEADER_PROXYERROR, HEADER_PROXYNAME,
};
use crate::proxy::metrics::{
    BoxError, ConnectionMetrics, Direction, MeteredBody, MeteredStream, MetricsAggregator,
    RequestOutcome,
};
use crate::proxy::middleware::ClientAuth;
use crate::proxy::mitm::{self, MitmSession};
use crate::proxy::rotation::{ConnectionGuard, SessionResolver};
use crate::proxy::sockets::TunnelSocketSet;
use crate::proxy::transport::{
    parse_authority, send_request, BoxedConnection, Target, TransportRegistry,
};
use crate::proxy::tunnel::TunnelHandler;

/// Body type of every response the relay produces
pub type RelayBody = BoxBody<Bytes, BoxError>;

/// Seconds a client should wait before retrying a routing failure
const RETRY_AFTER_SECS: &str = "5";

pub(crate) fn full(bytes: impl Into<Bytes>) -> RelayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty() -> RelayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Lifecycle of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticating,
    Resolving,
    Connecting,
    Streaming,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

/// Tracks and logs state transitions of one connection
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        debug!(state = ConnectionState::Authenticating.as_str(), "Connection opened");
        Self {
            state: ConnectionState::Authenticating,
        }
    }

    pub(crate) fn advance(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(
            from = self.state.as_str(),
            to = next.as_str(),
            "Connection state changed"
        );
        self.state = next;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Relay settings taken from the environment
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub cert_duration: Duration,
    pub track_sockets: bool,
    pub fingerprint_header: Option<HeaderName>,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            cert_duration: config.cert_duration,
            track_sockets: config.track_sockets,
            fingerprint_header: config.fingerprint_header.clone(),
        }
    }
}

/// A failure together with the upstream it happened on, if any
#[derive(Debug)]
pub(crate) struct RelayFailure {
    pub(crate) error: RotorError,
    pub(crate) proxy_id: Option<String>,
}

impl RelayFailure {
    pub(crate) fn through(proxy: &UpstreamProxy, error: RotorError) -> Self {
        Self {
            error,
            proxy_id: Some(proxy.id.clone()),
        }
    }
}

impl From<RotorError> for RelayFailure {
    fn from(error: RotorError) -> Self {
        Self {
            error,
            proxy_id: None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    id: &'a str,
    message: String,
    method: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_id: Option<&'a str>,
}

/// JSON error response for a relay-side failure
///
/// `proxy_id` names the upstream in the body and, when `expose_proxy`, in the
/// diagnostic header.
pub(crate) fn error_response(
    error: &RotorError,
    method: &Method,
    url: &str,
    proxy_id: Option<&str>,
    expose_proxy: bool,
) -> Response<RelayBody> {
    let message = error.to_string();
    let body = ErrorBody {
        id: error.error_id(),
        message: message.clone(),
        method: method.as_str(),
        url,
        proxy_id: proxy_id.filter(|_| expose_proxy),
    };
    let payload = serde_json::to_vec(&body).unwrap_or_default();

    let mut response = Response::new(full(payload));
    *response.status_mut() = error.status_code();

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(HEADER_PROXYERROR),
        sanitize_header_value(&message),
    );
    if let Some(id) = proxy_id.filter(|_| expose_proxy) {
        headers.insert(HeaderName::from_static(HEADER_PROXYNAME), sanitize_header_value(id));
    }
    if error.is_retryable() {
        headers.insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    }
    if matches!(error, RotorError::MissingToken) {
        headers.insert(
            PROXY_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"rotor\""),
        );
    }

    response
}

/// One request on its way to an upstream
pub(crate) struct Exchange<'a> {
    pub(crate) project: &'a ProjectToConnect,
    pub(crate) proxy: &'a Arc<UpstreamProxy>,
    pub(crate) target: &'a Target,
    pub(crate) method: Method,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Incoming,
    pub(crate) metrics: ConnectionMetrics,
    pub(crate) sockets: TunnelSocketSet,
    pub(crate) guard: ConnectionGuard,
}

/// Proxy request handler
pub struct ProxyHandler {
    commander: Arc<dyn Commander>,
    registry: Arc<TransportRegistry>,
    resolver: SessionResolver,
    shuffler: CipherShuffler,
    certificates: MitmCertCache,
    metrics: Arc<MetricsAggregator>,
    sockets: TunnelSocketSet,
    settings: RelaySettings,
}

impl ProxyHandler {
    pub fn new(
        commander: Arc<dyn Commander>,
        registry: Arc<TransportRegistry>,
        metrics: Arc<MetricsAggregator>,
        settings: RelaySettings,
    ) -> Result<Self> {
        Ok(Self {
            resolver: SessionResolver::new(commander.clone()),
            shuffler: CipherShuffler::new()?,
            certificates: MitmCertCache::new(settings.cert_duration),
            sockets: TunnelSocketSet::new("relay"),
            commander,
            registry,
            metrics,
            settings,
        })
    }

    /// Server-wide socket registry
    pub fn sockets(&self) -> &TunnelSocketSet {
        &self.sockets
    }

    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    pub fn shuffler(&self) -> &CipherShuffler {
        &self.shuffler
    }

    pub fn certificates(&self) -> &MitmCertCache {
        &self.certificates
    }

    pub(crate) fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub(crate) fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Socket set for one logical operation
    pub(crate) fn operation_sockets(&self, name: impl Into<String>) -> TunnelSocketSet {
        if self.settings.track_sockets {
            self.sockets.child(name)
        } else {
            TunnelSocketSet::new(name)
        }
    }

    /// Idle timeout of connections through `proxy`
    pub(crate) fn idle_timeout(&self, proxy: &UpstreamProxy) -> Duration {
        if proxy.timeout_disconnected.is_zero() {
            self.settings.idle_timeout
        } else {
            proxy.timeout_disconnected
        }
    }

    /// Handle an incoming proxy request
    #[instrument(
        skip(self, req),
        fields(request_id = %Uuid::new_v4(), method = %req.method(), uri = %req.uri(), client = %client_addr)
    )]
    pub async fn handle(
        self: &Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<RelayBody> {
        let method = req.method().clone();
        let url = req.uri().to_string();
        let mut lifecycle = Lifecycle::new();

        let result = if method == Method::CONNECT {
            self.handle_connect(req, &mut lifecycle).await
        } else {
            self.handle_http(req, &mut lifecycle).await
        };

        match result {
            Ok(response) => response,
            Err(failure) => {
                lifecycle.advance(ConnectionState::Errored);
                log_failure(&failure, &method, &url);
                error_response(
                    &failure.error,
                    &method,
                    &url,
                    failure.proxy_id.as_deref(),
                    true,
                )
            }
        }
    }

    /// Plain HTTP: forward an absolute-form request and stream the answer
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        lifecycle: &mut Lifecycle,
    ) -> std::result::Result<Response<RelayBody>, RelayFailure> {
        let (mut parts, body) = req.into_parts();

        let token = ClientAuth::token(&parts.headers)?;
        let target = Target::from_uri(&parts.uri)?;
        let project = self
            .commander
            .get_project_to_connect(&token, ConnectMode::Default, Some(&target.host))
            .await?;
        let sticky = take_sticky_hint(&mut parts.headers);

        lifecycle.advance(ConnectionState::Resolving);
        let (resolution, guard) = self.resolver.resolve(&project, sticky.as_deref()).await?;
        let proxy = resolution.proxy;

        let exchange = Exchange {
            project: &project,
            proxy: &proxy,
            target: &target,
            method: parts.method,
            headers: parts.headers,
            body,
            metrics: self.metrics.attach(proxy.clone()),
            sockets: self.operation_sockets(format!("http {}", proxy.id)),
            guard,
        };
        let (mut response, _) = self
            .forward(exchange, lifecycle)
            .await
            .map_err(|e| RelayFailure::through(&proxy, e))?;

        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static(HEADER_PROXYNAME),
            sanitize_header_value(&proxy.id),
        );

        let domain = parse_domain(&target.host);
        let cookies = if project.cookie_session {
            session_cookies(&proxy.id, domain.as_deref(), target.is_https())
        } else if sticky.is_some() {
            expired_session_cookies(domain.as_deref(), target.is_https())
        } else {
            Vec::new()
        };
        for cookie in cookies {
            headers.append(SET_COOKIE, cookie);
        }

        Ok(response)
    }

    /// Send one request through its upstream
    ///
    /// Returns the filtered response, whose body keeps the exchange's sockets
    /// and connection slot alive, and the TLS config used towards the target.
    pub(crate) async fn forward(
        &self,
        exchange: Exchange<'_>,
        lifecycle: &mut Lifecycle,
    ) -> Result<(Response<RelayBody>, Arc<ClientConfig>)> {
        let Exchange {
            project,
            proxy,
            target,
            method,
            mut headers,
            body,
            metrics,
            sockets,
            guard,
        } = exchange;

        let transport = self.registry.get_by_name(&proxy.transport_type)?;

        strip_internal_headers(&mut headers);
        strip_internal_cookies(&mut headers);
        if project.useragent_override && !proxy.useragent.is_empty() {
            if let Ok(useragent) = HeaderValue::from_str(&proxy.useragent) {
                headers.insert(USER_AGENT, useragent);
            }
        }

        let args = transport.build_request_args(
            &method,
            target,
            headers,
            HeaderMap::new(),
            proxy,
            &sockets,
            self.settings.connect_timeout,
        )?;
        let tls = self.shuffler.client_config(project, &proxy.id)?;

        let outcome = RequestOutcome::new(metrics.clone());
        let idle = self.idle_timeout(proxy);

        lifecycle.advance(ConnectionState::Connecting);
        let connection = match tokio::time::timeout(
            self.settings.connect_timeout,
            args.open(tls.clone()),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                outcome.fail();
                return Err(e);
            }
            Err(_) => {
                outcome.fail();
                return Err(RotorError::Timeout);
            }
        };

        let upload = MeteredBody::new(body, metrics.clone(), Direction::Sent)
            .settling(outcome.clone())
            .idle_after(idle);
        let request = args.build_request(upload)?;
        let response = match tokio::time::timeout(idle, send_request(connection, request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                outcome.fail();
                return Err(e);
            }
            Err(_) => {
                outcome.fail();
                return Err(RotorError::Timeout);
            }
        };

        outcome.respond(response.status());
        lifecycle.advance(ConnectionState::Streaming);
        debug!(proxy_id = %proxy.id, status = %response.status(), "Upstream answered");

        let (mut parts, body) = response.into_parts();
        strip_internal_headers(&mut parts.headers);
        strip_internal_cookies(&mut parts.headers);

        let body = MeteredBody::new(body, metrics, Direction::Received)
            .settling(outcome)
            .idle_after(idle)
            .holding(sockets, Some(guard))
            .boxed();
        Ok((Response::from_parts(parts, body), tls))
    }

    /// `CONNECT`: open a blind tunnel, or hand the connection to a MITM
    /// session when the project intercepts HTTPS
    async fn handle_connect(
        self: &Arc<Self>,
        mut req: Request<Incoming>,
        lifecycle: &mut Lifecycle,
    ) -> std::result::Result<Response<RelayBody>, RelayFailure> {
        let token = ClientAuth::token(req.headers())?;
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (host, port) = parse_authority(&authority)?;
        let target = Target::in_tunnel(&host, port, &Uri::from_static("/"));

        let mode = ConnectMode::from_header(
            req.headers().get(HEADER_MODE).and_then(|v| v.to_str().ok()),
        );
        let project = self
            .commander
            .get_project_to_connect(&token, mode, Some(&host))
            .await?;
        let sticky = take_sticky_hint(req.headers_mut());

        if let Some(ca) = project.certificate.clone() {
            let certificate = self.certificates.get_or_issue(&project.id, &ca, &host)?;
            let session = MitmSession {
                project,
                host,
                port,
                sticky,
                certificate,
                sockets: self.operation_sockets(format!("mitm {}", target.authority())),
            };

            let on_upgrade: OnUpgrade = hyper::upgrade::on(&mut req);
            let handler = self.clone();
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => mitm::serve(handler, upgraded, session).await,
                    Err(e) => debug!("CONNECT upgrade failed: {}", e),
                }
            });

            debug!(target = %target.authority(), "Intercepting tunnel");
            return Ok(Response::new(empty()));
        }

        lifecycle.advance(ConnectionState::Resolving);
        let (resolution, guard) = self.resolver.resolve(&project, sticky.as_deref()).await?;
        let proxy = resolution.proxy;
        let metrics = self.metrics.attach(proxy.clone());
        let sockets = self.operation_sockets(format!("tunnel {}", proxy.id));

        lifecycle.advance(ConnectionState::Connecting);
        let upstream = self
            .open_tunnel(&proxy, &target, &sockets, &metrics)
            .await
            .map_err(|e| RelayFailure::through(&proxy, e))?;

        info!(
            proxy_id = %proxy.id,
            target = %target.authority(),
            "CONNECT tunnel established"
        );

        let on_upgrade: OnUpgrade = hyper::upgrade::on(&mut req);
        let idle = self.idle_timeout(&proxy);
        let tunnel_proxy = proxy.id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut lifecycle = Lifecycle {
                state: ConnectionState::Connecting,
            };
            match on_upgrade.await {
                Ok(upgraded) => {
                    lifecycle.advance(ConnectionState::Streaming);
                    let client = sockets.track(TokioIo::new(upgraded), "client");
                    let server = MeteredStream::new(upstream, metrics.clone());
                    let result = TunnelHandler::copy_bidirectional(client, server, idle).await;
                    metrics.record_tunnel(result.is_ok());
                    match result {
                        Ok(_) => lifecycle.advance(ConnectionState::Closed),
                        Err(e) => {
                            debug!(proxy_id = %tunnel_proxy, "Tunnel ended with error: {}", e);
                            lifecycle.advance(ConnectionState::Errored);
                        }
                    }
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                    metrics.record_failure();
                    lifecycle.advance(ConnectionState::Errored);
                }
            }
            sockets.close_all();
        });

        let mut response = Response::new(empty());
        response.headers_mut().insert(
            HeaderName::from_static(HEADER_PROXYNAME),
            sanitize_header_value(&proxy.id),
        );
        Ok(response)
    }

    async fn open_tunnel(
        &self,
        proxy: &Arc<UpstreamProxy>,
        target: &Target,
        sockets: &TunnelSocketSet,
        metrics: &ConnectionMetrics,
    ) -> Result<BoxedConnection> {
        let transport = self.registry.get_by_name(&proxy.transport_type)?;
        let timeout = self.settings.connect_timeout;

        match tokio::time::timeout(
            timeout,
            transport.connect(&target.authority(), HeaderMap::new(), proxy, sockets, timeout),
        )
        .await
        {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => {
                metrics.record_failure();
                Err(e)
            }
            Err(_) => {
                metrics.record_failure();
                Err(RotorError::Timeout)
            }
        }
    }
}

fn log_failure(failure: &RelayFailure, method: &Method, url: &str) {
    let error = &failure.error;
    let proxy_id = failure.proxy_id.as_deref().unwrap_or("-");
    if error.is_server_error() && !error.is_retryable() {
        warn!(%method, url, proxy_id, error_id = error.error_id(), "Relay failed: {}", error);
    } else {
        debug!(%method, url, proxy_id, error_id = error.error_id(), "Request refused: {}", error);
    }
}
