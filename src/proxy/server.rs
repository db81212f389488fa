//! Relay server implementation using hyper
//!
//! Accepts client connections and hands every request to the
//! [`ProxyHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::{Result, RotorError};
use crate::proxy::handler::{error_response, ProxyHandler};
use crate::proxy::transport::unsupported_scheme;

/// Bytes peeked to find the request line
const SNIFF_LEN: usize = 2048;

/// Relay server
pub struct ProxyServer {
    addr: String,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    pub fn new(addr: impl Into<String>, handler: Arc<ProxyHandler>) -> Self {
        Self {
            addr: addr.into(),
            handler,
        }
    }

    pub fn handler(&self) -> &Arc<ProxyHandler> {
        &self.handler
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self.addr.parse().map_err(|_| {
            RotorError::InvalidConfig(format!("Invalid relay address: {}", self.addr))
        })?;
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Run the relay server
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until shutdown, then close every
    /// socket the relay still tracks
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, handler).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Relay shutting down");
                        break;
                    }
                }
            }
        }

        let sockets = self.handler.sockets();
        info!(open_sockets = sockets.len(), "Closing relayed sockets");
        sockets.close_all();
        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        if let Some((method, url, scheme)) = sniff_foreign_scheme(&stream).await {
            return refuse(stream, &method, &url, scheme).await;
        }
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req, client_addr).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(RotorError::from)?;

        Ok(())
    }
}

/// Peek at the request line for an absolute target whose scheme is not
/// http(s). hyper rejects some of those (`file:///...`) with a bare 400
/// before any handler runs.
async fn sniff_foreign_scheme(stream: &TcpStream) -> Option<(Method, String, String)> {
    let mut buf = [0u8; SNIFF_LEN];
    let n = stream.peek(&mut buf).await.ok()?;
    foreign_scheme(&buf[..n])
}

fn foreign_scheme(head: &[u8]) -> Option<(Method, String, String)> {
    let end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..end]).ok()?;
    let mut parts = line.split(' ');
    let method = Method::from_bytes(parts.next()?.as_bytes()).ok()?;
    let target = parts.next()?;
    if method == Method::CONNECT {
        return None;
    }

    let (scheme, _) = target.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid || scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
        return None;
    }
    Some((method, target.to_string(), scheme.to_string()))
}

/// Answer a foreign-scheme request with the relay's JSON error and close
async fn refuse(mut stream: TcpStream, method: &Method, url: &str, scheme: String) -> Result<()> {
    let error = unsupported_scheme(&scheme);
    debug!(method = %method, url, "Refusing request: {}", error);

    let (parts, body) = error_response(&error, method, url, None, false).into_parts();
    let body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or("Unsupported Protocol")
    );
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    head.push_str(&format!("content-length: {}\r\nconnection: close\r\n\r\n", body.len()));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    Ok(())
}
