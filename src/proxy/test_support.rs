//! In-process fake upstreams and a relay to drive them

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, PROXY_AUTHORIZATION,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::ServerConfig;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::commander::{Commander, InMemoryCommander};
use crate::models::{ProjectStatus, ProjectToConnect, ProxyConfig, ProxyStatus, UpstreamProxy};
use crate::proxy::handler::{ProxyHandler, RelaySettings};
use crate::proxy::metrics::MetricsAggregator;
use crate::proxy::middleware::ClientAuth;
use crate::proxy::rotation::RotationPolicy;
use crate::proxy::server::ProxyServer;
use crate::proxy::transport::{parse_connect_head, ConnectHead, ConnectorContext, TransportRegistry};

pub(crate) const FINGERPRINT_HEADER: &str = "x-test-cipher";

/// Request as the fake upstream received it
#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) headers: HeaderMap,
}

/// Forward proxy that also plays the origin
///
/// Absolute-form requests are answered directly. `CONNECT` is accepted and
/// the tunnel either echoes bytes or, with `origin_tls`, serves HTTPS.
pub(crate) struct FakeUpstream {
    pub(crate) name: String,
    pub(crate) addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl FakeUpstream {
    pub(crate) fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    pub(crate) fn proxy(&self, project_id: &str) -> UpstreamProxy {
        let raw = json!({
            "type": "http",
            "address": { "hostname": "127.0.0.1", "port": self.addr.port() }
        });
        let mut proxy =
            UpstreamProxy::new("local", &self.name, project_id, "proxy", ProxyConfig::Raw(raw));
        TransportRegistry::with_defaults()
            .get_by_name("proxy")
            .unwrap()
            .complete_proxy_config(&mut proxy, &ConnectorContext::default())
            .unwrap();
        proxy.with_status(ProxyStatus::Started)
    }
}

struct Origin {
    name: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    flaky_hits: AtomicUsize,
}

type OriginBody = BoxBody<Bytes, Infallible>;

fn text(status: StatusCode, body: String) -> Response<OriginBody> {
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed());
    *response.status_mut() = status;
    response
}

/// Announces 100 bytes, sends 3 and then goes silent
fn stalled() -> Response<OriginBody> {
    let frames = futures::stream::iter(vec![Ok::<_, Infallible>(Frame::data(
        Bytes::from_static(b"abc"),
    ))])
    .chain(futures::stream::pending());
    let mut response = Response::new(BodyExt::boxed(StreamBody::new(frames)));
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
    response
}

impl Origin {
    async fn answer(&self, req: Request<Incoming>) -> Response<OriginBody> {
        self.seen.lock().push(SeenRequest {
            method: req.method().clone(),
            uri: req.uri().to_string(),
            headers: req.headers().clone(),
        });

        let path = req.uri().path().to_string();
        let mut response = match path.as_str() {
            "/upload" => {
                let received = match req.into_body().collect().await {
                    Ok(collected) => collected.to_bytes().len(),
                    Err(_) => 0,
                };
                text(StatusCode::OK, received.to_string())
            }
            "/stall" => stalled(),
            sized if sized.starts_with("/bytes/") => {
                let size: usize = sized["/bytes/".len()..].parse().unwrap_or(0);
                text(StatusCode::OK, "x".repeat(size))
            }
            "/json" => text(
                StatusCode::OK,
                json!({ "ip": "198.51.100.7", "countryCode": "FR", "cityName": "Paris" })
                    .to_string(),
            ),
            "/redirect" => {
                let mut response = text(StatusCode::FOUND, String::new());
                response
                    .headers_mut()
                    .insert("location", HeaderValue::from_static("/json"));
                response
            }
            "/loop" => {
                let mut response = text(StatusCode::FOUND, String::new());
                let host = req
                    .headers()
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or_default();
                let location = format!("http://{}/loop", host);
                response
                    .headers_mut()
                    .insert("location", HeaderValue::from_str(&location).unwrap());
                response
            }
            "/flaky" => {
                if self.flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    text(StatusCode::SERVICE_UNAVAILABLE, "warming up".to_string())
                } else {
                    text(StatusCode::OK, json!({ "ip": "203.0.113.9" }).to_string())
                }
            }
            "/status/404" => text(StatusCode::NOT_FOUND, format!("{} missing", self.name)),
            _ => text(StatusCode::OK, format!("{} {}", self.name, path)),
        };

        let headers = response.headers_mut();
        headers.insert("x-upstream", HeaderValue::from_str(&self.name).unwrap());
        headers.insert("x-rotor-proxyname", HeaderValue::from_static("forged"));
        headers.append("set-cookie", HeaderValue::from_static("rotor-proxyname=forged; HttpOnly"));
        headers.append("set-cookie", HeaderValue::from_static("session=abc; Path=/"));
        response
    }
}

async fn serve_origin<S>(origin: Arc<Origin>, io: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let origin = origin.clone();
        async move { Ok::<_, Infallible>(origin.answer(req).await) }
    });
    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await;
}

/// Start a fake upstream on an ephemeral port
pub(crate) async fn spawn_upstream(name: &str, origin_tls: Option<Arc<ServerConfig>>) -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let origin = Arc::new(Origin {
        name: name.to_string(),
        seen: seen.clone(),
        flaky_hits: AtomicUsize::new(0),
    });

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let origin = origin.clone();
            let origin_tls = origin_tls.clone();

            tokio::spawn(async move {
                let service = service_fn(move |mut req: Request<Incoming>| {
                    let origin = origin.clone();
                    let origin_tls = origin_tls.clone();
                    async move {
                        if req.method() != Method::CONNECT {
                            return Ok::<_, Infallible>(origin.answer(req).await);
                        }

                        origin.seen.lock().push(SeenRequest {
                            method: Method::CONNECT,
                            uri: req.uri().to_string(),
                            headers: req.headers().clone(),
                        });
                        let on_upgrade = hyper::upgrade::on(&mut req);
                        tokio::spawn(async move {
                            let Ok(upgraded) = on_upgrade.await else {
                                return;
                            };
                            let io = TokioIo::new(upgraded);
                            match origin_tls {
                                Some(config) => {
                                    if let Ok(tls) = TlsAcceptor::from(config).accept(io).await {
                                        serve_origin(origin, tls).await;
                                    }
                                }
                                None => {
                                    let (mut reader, mut writer) = tokio::io::split(io);
                                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                                    let _ = writer.shutdown().await;
                                }
                            }
                        });
                        Ok(Response::new(Empty::<Bytes>::new().boxed()))
                    }
                });

                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    FakeUpstream {
        name: name.to_string(),
        addr,
        seen,
    }
}

pub(crate) fn token() -> String {
    ClientAuth::encode("user", "pass")
}

pub(crate) fn project() -> ProjectToConnect {
    ProjectToConnect {
        id: "p1".to_string(),
        name: "scraping".to_string(),
        token: token(),
        status: ProjectStatus::Hot,
        mitm: false,
        certificate: None,
        ciphers_shuffle: false,
        auto_scale_up: false,
        cookie_session: false,
        useragent_override: false,
        rotation: RotationPolicy::RoundRobin,
        max_connections_per_proxy: None,
    }
}

/// Relay listening on an ephemeral port
pub(crate) struct TestRelay {
    pub(crate) addr: SocketAddr,
    pub(crate) commander: Arc<InMemoryCommander>,
    pub(crate) handler: Arc<ProxyHandler>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) server: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    pub(crate) async fn proxies(&self, project_id: &str) -> Vec<Arc<UpstreamProxy>> {
        self.commander.get_proxies_to_connect(project_id).await.unwrap()
    }

    /// Wait until the project's proxies counted `expected` requests in total
    pub(crate) async fn wait_for_requests(&self, project_id: &str, expected: u64) -> u64 {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let total: u64 = self
                .proxies(project_id)
                .await
                .iter()
                .map(|p| p.counters().snapshot().requests)
                .sum();
            if total >= expected || tokio::time::Instant::now() > deadline {
                return total;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub(crate) async fn spawn_relay(project: ProjectToConnect, upstreams: &[&FakeUpstream]) -> TestRelay {
    let commander = Arc::new(InMemoryCommander::new());
    for upstream in upstreams {
        commander.add_proxy(Arc::new(upstream.proxy(&project.id)));
    }
    commander.add_project(project);

    let registry = Arc::new(TransportRegistry::with_defaults());
    let metrics = Arc::new(MetricsAggregator::new(
        commander.clone(),
        Duration::from_secs(60),
    ));
    let settings = RelaySettings {
        connect_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(2),
        cert_duration: Duration::from_secs(3600),
        track_sockets: true,
        fingerprint_header: Some(HeaderName::from_static(FINGERPRINT_HEADER)),
    };
    let handler = Arc::new(
        ProxyHandler::new(commander.clone(), registry, metrics, settings).unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let server = ProxyServer::new(addr.to_string(), handler.clone());
    let server = tokio::spawn(async move {
        server.serve(listener, rx).await.unwrap();
    });

    TestRelay {
        addr,
        commander,
        handler,
        shutdown,
        server,
    }
}

/// Response as a client of the relay sees it
pub(crate) struct ClientResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: String,
}

/// Send one absolute-form `GET` through the relay
pub(crate) async fn http_request(
    relay: SocketAddr,
    url: &str,
    token: Option<&str>,
    extra: &[(&str, &str)],
) -> ClientResponse {
    http_send(relay, Method::GET, url, token, extra, Bytes::new()).await
}

/// Send one absolute-form request with a body through the relay
pub(crate) async fn http_send(
    relay: SocketAddr,
    method: Method,
    url: &str,
    token: Option<&str>,
    extra: &[(&str, &str)],
    body: Bytes,
) -> ClientResponse {
    let stream = TcpStream::connect(relay).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);

    let uri: hyper::Uri = url.parse().unwrap();
    let mut builder = Request::builder().method(method).uri(url);
    if let Some(authority) = uri.authority() {
        builder = builder.header(HOST, authority.as_str());
    }
    if let Some(token) = token {
        builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", token));
    }
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::new(body)).unwrap();

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();

    ClientResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    }
}

/// Write `request` as is and read until the relay closes the connection
///
/// Gives up after `limit`; the second value tells whether the relay closed
/// in time.
pub(crate) async fn raw_exchange(relay: SocketAddr, request: &str, limit: Duration) -> (String, bool) {
    let mut stream = TcpStream::connect(relay).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    let closed = tokio::time::timeout(limit, async {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .is_ok();

    (String::from_utf8_lossy(&received).to_string(), closed)
}

/// Issue a `CONNECT` through the relay and return the raw stream after the
/// response head
pub(crate) async fn connect(
    relay: SocketAddr,
    authority: &str,
    token: &str,
    extra: &[(&str, &str)],
) -> (ConnectHead, TcpStream) {
    let mut stream = TcpStream::connect(relay).await.unwrap();
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: Basic {}\r\n",
        authority, authority, token
    );
    for (name, value) in extra {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    (parse_connect_head(&head).unwrap(), stream)
}
