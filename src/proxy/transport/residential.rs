//! Credentialed gateway transport
//!
//! Plain HTTP targets are sent as absolute-form requests carrying
//! `Proxy-Authorization`. HTTPS targets go through an authenticated
//! `CONNECT`, then TLS to the target.

use std::time::Duration;

use hyper::header::{HeaderMap, PROXY_AUTHORIZATION};
use hyper::Method;

use super::{
    basic_auth, config_mismatch, parse_raw_config, ConnectArgs, ConnectStep, ConnectorContext,
    Endpoint, RequestArgs, Route, Target, Transport, TransportKind,
};
use crate::error::Result;
use crate::models::{ProxyConfig, ResidentialConfig, UpstreamProxy};
use crate::proxy::sockets::TunnelSocketSet;

/// Transport for gateways whose config already carries address and credentials
pub struct ResidentialTransport;

impl Transport for ResidentialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Residential
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut UpstreamProxy,
        _connector: &ConnectorContext,
    ) -> Result<()> {
        if let ProxyConfig::Raw(value) = &proxy.config {
            let config: ResidentialConfig = parse_raw_config(proxy, value)?;
            proxy.config = ProxyConfig::Residential(config);
        }
        Ok(())
    }

    fn build_request_args(
        &self,
        method: &Method,
        target: &Target,
        headers: HeaderMap,
        connect_headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<RequestArgs> {
        let config = residential_config(proxy, self.kind())?;
        gateway_request_args(
            config,
            method,
            target,
            headers,
            connect_headers,
            sockets,
            timeout,
            None,
        )
    }

    fn build_connect_args(
        &self,
        authority: &str,
        headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<ConnectArgs> {
        let config = residential_config(proxy, self.kind())?;
        gateway_connect_args(config, authority, headers, sockets, timeout, None)
    }
}

pub(super) fn residential_config(
    proxy: &UpstreamProxy,
    kind: TransportKind,
) -> Result<&ResidentialConfig> {
    match &proxy.config {
        ProxyConfig::Residential(config) => Ok(config),
        _ => Err(config_mismatch(proxy, kind)),
    }
}

#[allow(clippy::too_many_arguments)]
pub(super) fn gateway_request_args(
    config: &ResidentialConfig,
    method: &Method,
    target: &Target,
    mut headers: HeaderMap,
    mut connect_headers: HeaderMap,
    sockets: &TunnelSocketSet,
    timeout: Duration,
    error_header: Option<&'static str>,
) -> Result<RequestArgs> {
    let auth = basic_auth(&config.username, &config.password)?;

    let route = if target.is_https() {
        connect_headers.insert(PROXY_AUTHORIZATION, auth);
        Route::Connect(ConnectStep {
            authority: target.authority(),
            headers: connect_headers,
        })
    } else {
        headers.insert(PROXY_AUTHORIZATION, auth);
        Route::Forward
    };

    Ok(RequestArgs {
        method: method.clone(),
        endpoint: Endpoint::plain(config.address.clone()),
        route,
        target: target.clone(),
        headers,
        timeout,
        sockets: sockets.clone(),
        error_header,
    })
}

pub(super) fn gateway_connect_args(
    config: &ResidentialConfig,
    authority: &str,
    mut headers: HeaderMap,
    sockets: &TunnelSocketSet,
    timeout: Duration,
    error_header: Option<&'static str>,
) -> Result<ConnectArgs> {
    headers.insert(
        PROXY_AUTHORIZATION,
        basic_auth(&config.username, &config.password)?,
    );

    Ok(ConnectArgs {
        endpoint: Endpoint::plain(config.address.clone()),
        route: Route::Connect(ConnectStep {
            authority: authority.to_string(),
            headers,
        }),
        timeout,
        sockets: sockets.clone(),
        error_header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Uri;
    use serde_json::json;

    fn gateway_proxy() -> UpstreamProxy {
        let mut proxy = UpstreamProxy::new(
            "conn",
            "k1",
            "p1",
            "residential",
            ProxyConfig::Raw(json!({
                "address": { "hostname": "gw.example.net", "port": 8000 },
                "username": "user",
                "password": "secret"
            })),
        );
        ResidentialTransport
            .complete_proxy_config(&mut proxy, &ConnectorContext::default())
            .unwrap();
        proxy
    }

    #[test]
    fn test_complete_proxy_config_parses_raw() {
        let proxy = gateway_proxy();
        match &proxy.config {
            ProxyConfig::Residential(config) => {
                assert_eq!(config.address.hostname, "gw.example.net");
                assert_eq!(config.address.port, 8000);
                assert_eq!(config.username, "user");
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_complete_proxy_config_rejects_invalid() {
        let mut proxy = UpstreamProxy::new(
            "conn",
            "k1",
            "p1",
            "residential",
            ProxyConfig::Raw(json!({ "username": "user" })),
        );
        assert!(ResidentialTransport
            .complete_proxy_config(&mut proxy, &ConnectorContext::default())
            .is_err());
    }

    #[test]
    fn test_http_target_is_forwarded_with_auth() {
        let proxy = gateway_proxy();
        let target = Target::from_uri(&Uri::from_static("http://example.com/a?b=1")).unwrap();
        let args = ResidentialTransport
            .build_request_args(
                &Method::GET,
                &target,
                HeaderMap::new(),
                HeaderMap::new(),
                &proxy,
                &TunnelSocketSet::new("test"),
                Duration::from_secs(5),
            )
            .unwrap();

        assert!(matches!(args.route, Route::Forward));
        assert!(!args.tls_to_target());
        assert_eq!(args.request_uri(), "http://example.com/a?b=1");
        assert_eq!(
            args.headers.get(PROXY_AUTHORIZATION).unwrap(),
            "Basic dXNlcjpzZWNyZXQ="
        );
    }

    #[test]
    fn test_https_target_uses_connect_with_auth() {
        let proxy = gateway_proxy();
        let target = Target::from_uri(&Uri::from_static("https://example.com/path")).unwrap();
        let args = ResidentialTransport
            .build_request_args(
                &Method::GET,
                &target,
                HeaderMap::new(),
                HeaderMap::new(),
                &proxy,
                &TunnelSocketSet::new("test"),
                Duration::from_secs(5),
            )
            .unwrap();

        match &args.route {
            Route::Connect(step) => {
                assert_eq!(step.authority, "example.com:443");
                assert!(step.headers.contains_key(PROXY_AUTHORIZATION));
            }
            other => panic!("unexpected route {:?}", other),
        }
        assert!(!args.headers.contains_key(PROXY_AUTHORIZATION));
        assert!(args.tls_to_target());
        assert_eq!(args.request_uri(), "/path");
    }

    #[test]
    fn test_connect_args() {
        let proxy = gateway_proxy();
        let args = ResidentialTransport
            .build_connect_args(
                "example.com:443",
                HeaderMap::new(),
                &proxy,
                &TunnelSocketSet::new("test"),
                Duration::from_secs(5),
            )
            .unwrap();

        assert_eq!(args.endpoint.address.hostname, "gw.example.net");
        assert!(args.endpoint.tls.is_none());
        assert!(matches!(args.route, Route::Connect(ref step) if step.authority == "example.com:443"));
    }
}
