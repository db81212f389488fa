//! MITM sessions
//!
//! After answering a `CONNECT` with `200`, the relay terminates the client's
//! TLS with a certificate issued for the requested host and serves HTTP/1.1
//! on the decrypted stream. Every inner request is resolved and forwarded on
//! its own, over a fresh outbound TLS leg.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument};

use crate::error::{Result, RotorError};
use crate::models::ProjectToConnect;
use crate::proxy::certificate::MitmCertificate;
use crate::proxy::fingerprint::cipher_digest;
use crate::proxy::handler::{
    error_response, ConnectionState, Exchange, Lifecycle, ProxyHandler, RelayBody, RelayFailure,
};
use crate::proxy::headers::take_sticky_hint;
use crate::proxy::sockets::TunnelSocketSet;
use crate::proxy::transport::Target;

/// State shared by every request of one intercepted tunnel
pub(crate) struct MitmSession {
    pub(crate) project: ProjectToConnect,
    pub(crate) host: String,
    pub(crate) port: u16,
    /// Sticky hint sent on the `CONNECT` itself
    pub(crate) sticky: Option<String>,
    pub(crate) certificate: Arc<MitmCertificate>,
    pub(crate) sockets: TunnelSocketSet,
}

/// Terminate TLS on `upgraded` and relay the decrypted requests
#[instrument(skip_all, fields(project_id = %session.project.id, host = %session.host))]
pub(crate) async fn serve(handler: Arc<ProxyHandler>, upgraded: Upgraded, session: MitmSession) {
    let sockets = session.sockets.clone();
    if let Err(e) = serve_session(handler, upgraded, Arc::new(session)).await {
        debug!("MITM session ended: {}", e);
    }
    sockets.close_all();
}

async fn serve_session(
    handler: Arc<ProxyHandler>,
    upgraded: Upgraded,
    session: Arc<MitmSession>,
) -> Result<()> {
    let client = session.sockets.track(TokioIo::new(upgraded), "mitm client");
    let acceptor = TlsAcceptor::from(session.certificate.server_config.clone());

    let tls = tokio::time::timeout(handler.settings().connect_timeout, acceptor.accept(client))
        .await
        .map_err(|_| RotorError::Timeout)?
        .map_err(|e| RotorError::Tls(format!("Client TLS handshake failed: {}", e)))?;
    debug!("Client TLS established");

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let session = session.clone();
        async move { Ok::<_, Infallible>(handle_intercepted(&handler, &session, req).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(RotorError::from)
}

/// One decrypted request. Nothing in the answer reveals which upstream
/// carried it.
async fn handle_intercepted(
    handler: &ProxyHandler,
    session: &MitmSession,
    req: Request<Incoming>,
) -> Response<RelayBody> {
    let method = req.method().clone();
    let target = Target::in_tunnel(&session.host, session.port, req.uri());
    let url = target.absolute_url();
    let mut lifecycle = Lifecycle::new();

    match forward_intercepted(handler, session, &target, req, &mut lifecycle).await {
        Ok(response) => response,
        Err(failure) => {
            lifecycle.advance(ConnectionState::Errored);
            debug!(url = %url, "Intercepted request failed: {}", failure.error);
            error_response(
                &failure.error,
                &method,
                &url,
                failure.proxy_id.as_deref(),
                false,
            )
        }
    }
}

async fn forward_intercepted(
    handler: &ProxyHandler,
    session: &MitmSession,
    target: &Target,
    req: Request<Incoming>,
    lifecycle: &mut Lifecycle,
) -> std::result::Result<Response<RelayBody>, RelayFailure> {
    let (mut parts, body) = req.into_parts();
    let sticky = take_sticky_hint(&mut parts.headers).or_else(|| session.sticky.clone());

    lifecycle.advance(ConnectionState::Resolving);
    let (resolution, guard) = handler
        .resolver()
        .resolve(&session.project, sticky.as_deref())
        .await?;
    let proxy = resolution.proxy;

    let exchange = Exchange {
        project: &session.project,
        proxy: &proxy,
        target,
        method: parts.method,
        headers: parts.headers,
        body,
        metrics: handler.metrics().attach(proxy.clone()),
        sockets: session.sockets.child(format!("mitm request {}", proxy.id)),
        guard,
    };
    let (mut response, tls) = handler
        .forward(exchange, lifecycle)
        .await
        .map_err(|e| RelayFailure::through(&proxy, e))?;

    if let Some(name) = &handler.settings().fingerprint_header {
        if let Ok(digest) = HeaderValue::from_str(&cipher_digest(&tls)) {
            response.headers_mut().insert(name.clone(), digest);
        }
    }

    Ok(response)
}
