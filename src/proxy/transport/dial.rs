//! Opening upstream connections
//!
//! TCP to the proxy, optional TLS to the proxy, then a CONNECT or SOCKS
//! handshake. Every TCP stream is tracked in the operation's socket set.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, trace};

use super::{BoxedConnection, ConnectStep, Endpoint, Route, SocksStep, SocksVersion};
use crate::error::{Result, RotorError};
use crate::proxy::sockets::TunnelSocketSet;

const MAX_CONNECT_HEAD: usize = 16 * 1024;

pub(super) async fn establish(
    endpoint: &Endpoint,
    route: &Route,
    sockets: &TunnelSocketSet,
    timeout: Duration,
    error_header: Option<&str>,
) -> Result<BoxedConnection> {
    let address = &endpoint.address;
    debug!("Connecting to proxy at {}", address);

    let tcp = tokio::time::timeout(
        timeout,
        TcpStream::connect((address.hostname.as_str(), address.port)),
    )
    .await
    .map_err(|_| RotorError::Timeout)?
    .map_err(|e| RotorError::transport(format!("Cannot connect to {}: {}", address, e)))?;
    let _ = tcp.set_nodelay(true);

    let tracked = sockets.track(tcp, format!("upstream {}", address));
    let stream: BoxedConnection = match &endpoint.tls {
        Some(tls) => {
            tls_connect(
                Box::new(tracked),
                &tls.server_name,
                tls.config.clone(),
                timeout,
            )
            .await?
        }
        None => Box::new(tracked),
    };

    match route {
        Route::Forward => Ok(stream),
        Route::Connect(step) => {
            tokio::time::timeout(timeout, connect_through(stream, step, error_header))
                .await
                .map_err(|_| RotorError::Timeout)?
        }
        Route::Socks(step) => tokio::time::timeout(timeout, socks_handshake(stream, step))
            .await
            .map_err(|_| RotorError::Timeout)?,
    }
}

/// Wrap `stream` in a client TLS session
pub(crate) async fn tls_connect(
    stream: BoxedConnection,
    host: &str,
    config: Arc<ClientConfig>,
    timeout: Duration,
) -> Result<BoxedConnection> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| RotorError::Tls(format!("Invalid server name {}: {}", host, e)))?;

    let connector = TlsConnector::from(config);
    let tls = tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| RotorError::Timeout)?
        .map_err(|e| RotorError::Tls(format!("TLS handshake with {} failed: {}", host, e)))?;

    Ok(Box::new(tls))
}

/// Build HTTP CONNECT request
fn build_connect_request(step: &ConnectStep) -> Vec<u8> {
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
        step.authority, step.authority
    )
    .into_bytes();

    for (name, value) in &step.headers {
        if name == HOST {
            continue;
        }
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    request.extend_from_slice(b"\r\n");
    request
}

async fn connect_through(
    mut stream: BoxedConnection,
    step: &ConnectStep,
    error_header: Option<&str>,
) -> Result<BoxedConnection> {
    trace!(authority = %step.authority, "Sending CONNECT");
    let request = build_connect_request(step);
    stream
        .write_all(&request)
        .await
        .map_err(|e| RotorError::transport(format!("Failed to send CONNECT: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| RotorError::transport(format!("Failed to send CONNECT: {}", e)))?;

    let (raw, rest) = read_head(&mut stream).await?;
    let head = parse_connect_head(&raw)?;
    if head.status != 200 {
        return Err(head.into_error(error_header));
    }

    debug!("HTTP CONNECT tunnel established");
    if rest.is_empty() {
        Ok(stream)
    } else {
        Ok(Box::new(Rewind::new(rest.freeze(), stream)))
    }
}

/// Read the response head in chunks; bytes read past it are returned
/// alongside
async fn read_head(stream: &mut BoxedConnection) -> Result<(BytesMut, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    let mut scanned: usize = 0;
    loop {
        let n = stream.read_buf(&mut buf).await.map_err(|e| {
            RotorError::transport(format!("Failed to read CONNECT response: {}", e))
        })?;
        if n == 0 {
            return Err(RotorError::transport("socket hang up"));
        }

        // Resume a few bytes back in case the terminator straddles two reads
        let from = scanned.saturating_sub(3);
        if let Some(pos) = buf[from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(from + pos + 4);
            return Ok((head, buf));
        }
        scanned = buf.len();

        if buf.len() > MAX_CONNECT_HEAD {
            return Err(RotorError::transport("CONNECT response head too large"));
        }
    }
}

pin_project! {
    /// Connection that first replays bytes already read from it
    struct Rewind<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> Rewind<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Status line and headers of a CONNECT response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Typed error for a refused CONNECT, preferring the upstream's own
    /// error header over the reason phrase
    pub fn into_error(self, error_header: Option<&str>) -> RotorError {
        let message = error_header
            .and_then(|h| self.header(h))
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| Some(self.reason.clone()).filter(|r| !r.is_empty()))
            .unwrap_or_else(|| format!("CONNECT refused with status {}", self.status));
        RotorError::upstream(self.status, message)
    }
}

/// Parse the head of a CONNECT response
pub fn parse_connect_head(raw: &[u8]) -> Result<ConnectHead> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(RotorError::transport(format!(
            "Invalid CONNECT response: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            RotorError::transport(format!("Invalid CONNECT status line: {}", status_line))
        })?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let headers = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(ConnectHead {
        status,
        reason,
        headers,
    })
}

async fn socks_handshake(stream: BoxedConnection, step: &SocksStep) -> Result<BoxedConnection> {
    let target = (step.host.as_str(), step.port);
    let socks_error = |e: tokio_socks::Error| {
        RotorError::transport(format!("SOCKS handshake with proxy failed: {}", e))
    };

    match step.version {
        SocksVersion::V5 => {
            let socks = match &step.credentials {
                Some((username, password)) => {
                    Socks5Stream::connect_with_password_and_socket(
                        stream, target, username, password,
                    )
                    .await
                }
                None => Socks5Stream::connect_with_socket(stream, target).await,
            }
            .map_err(socks_error)?;
            debug!("SOCKS5 connection established");
            Ok(socks.into_inner())
        }
        SocksVersion::V4 => {
            let socks = match &step.credentials {
                Some((user_id, _)) => {
                    Socks4Stream::connect_with_userid_and_socket(stream, target, user_id).await
                }
                None => Socks4Stream::connect_with_socket(stream, target).await,
            }
            .map_err(socks_error)?;
            debug!("SOCKS4 connection established");
            Ok(socks.into_inner())
        }
    }
}

/// Send one request over an opened connection using hyper's HTTP/1 client
pub async fn send_request<B>(conn: BoxedConnection, request: Request<B>) -> Result<Response<Incoming>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = TokioIo::new(conn);
    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .title_case_headers(true)
        .preserve_header_case(true)
        .handshake(io)
        .await
        .map_err(|e| RotorError::transport(format!("Handshake failed: {}", e)))?;

    // Drives the connection until the response body is consumed
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| RotorError::transport(format!("Request failed: {}", e)))
}
