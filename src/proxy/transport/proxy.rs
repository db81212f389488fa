//! User-supplied proxy transport (http, https, socks4, socks5)

use std::time::Duration;

use hyper::header::{HeaderMap, PROXY_AUTHORIZATION};
use hyper::Method;

use super::{
    basic_auth, config_mismatch, parse_authority, parse_raw_config, ConnectArgs, ConnectStep,
    ConnectorContext, Endpoint, ProxyTls, RequestArgs, Route, SocksStep, SocksVersion, Target,
    Transport, TransportKind,
};
use crate::error::Result;
use crate::models::{ProxyConfig, ProxyType, UpstreamProxy, UserProxyConfig};
use crate::proxy::fingerprint::proxy_tls_config;
use crate::proxy::sockets::TunnelSocketSet;

pub struct ProxyTransport;

impl ProxyTransport {
    fn config<'a>(&self, proxy: &'a UpstreamProxy) -> Result<&'a UserProxyConfig> {
        match &proxy.config {
            ProxyConfig::Proxy(config) => Ok(config),
            _ => Err(config_mismatch(proxy, self.kind())),
        }
    }

    fn endpoint(config: &UserProxyConfig) -> Result<Endpoint> {
        let tls = match config.proxy_type {
            ProxyType::Https => Some(ProxyTls {
                server_name: config.address.hostname.clone(),
                config: proxy_tls_config(None)?,
            }),
            _ => None,
        };
        Ok(Endpoint {
            address: config.address.clone(),
            tls,
        })
    }

    fn socks_route(
        config: &UserProxyConfig,
        version: SocksVersion,
        host: &str,
        port: u16,
    ) -> Route {
        Route::Socks(SocksStep {
            version,
            credentials: config
                .auth
                .as_ref()
                .map(|auth| (auth.username.clone(), auth.password.clone())),
            host: host.to_string(),
            port,
        })
    }

    fn connect_step(
        config: &UserProxyConfig,
        authority: String,
        mut headers: HeaderMap,
    ) -> Result<Route> {
        if let Some(auth) = &config.auth {
            headers.insert(
                PROXY_AUTHORIZATION,
                basic_auth(&auth.username, &auth.password)?,
            );
        }
        Ok(Route::Connect(ConnectStep { authority, headers }))
    }
}

impl Transport for ProxyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Proxy
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut UpstreamProxy,
        _connector: &ConnectorContext,
    ) -> Result<()> {
        if let ProxyConfig::Raw(value) = &proxy.config {
            let config: UserProxyConfig = parse_raw_config(proxy, value)?;
            proxy.config = ProxyConfig::Proxy(config);
        }
        Ok(())
    }

    fn build_request_args(
        &self,
        method: &Method,
        target: &Target,
        mut headers: HeaderMap,
        connect_headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<RequestArgs> {
        let config = self.config(proxy)?;

        let route = match config.proxy_type {
            ProxyType::Http | ProxyType::Https if target.is_https() => {
                Self::connect_step(config, target.authority(), connect_headers)?
            }
            ProxyType::Http | ProxyType::Https => {
                if let Some(auth) = &config.auth {
                    headers.insert(
                        PROXY_AUTHORIZATION,
                        basic_auth(&auth.username, &auth.password)?,
                    );
                }
                Route::Forward
            }
            ProxyType::Socks4 => {
                Self::socks_route(config, SocksVersion::V4, &target.host, target.port)
            }
            ProxyType::Socks5 => {
                Self::socks_route(config, SocksVersion::V5, &target.host, target.port)
            }
        };

        Ok(RequestArgs {
            method: method.clone(),
            endpoint: Self::endpoint(config)?,
            route,
            target: target.clone(),
            headers,
            timeout,
            sockets: sockets.clone(),
            error_header: None,
        })
    }

    fn build_connect_args(
        &self,
        authority: &str,
        headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<ConnectArgs> {
        let config = self.config(proxy)?;

        let route = match config.proxy_type {
            ProxyType::Http | ProxyType::Https => {
                Self::connect_step(config, authority.to_string(), headers)?
            }
            ProxyType::Socks4 => {
                let (host, port) = parse_authority(authority)?;
                Self::socks_route(config, SocksVersion::V4, &host, port)
            }
            ProxyType::Socks5 => {
                let (host, port) = parse_authority(authority)?;
                Self::socks_route(config, SocksVersion::V5, &host, port)
            }
        };

        Ok(ConnectArgs {
            endpoint: Self::endpoint(config)?,
            route,
            timeout,
            sockets: sockets.clone(),
            error_header: None,
        })
    }
}
