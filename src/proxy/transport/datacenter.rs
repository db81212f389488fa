//! Cloud instance transport
//!
//! Instances run a small CONNECT proxy. Every request goes through a
//! `CONNECT`, over mutual TLS when the instance has a certificate.

use std::time::Duration;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::Method;

use super::{
    config_mismatch, parse_raw_config, ConnectArgs, ConnectStep, ConnectorContext, Endpoint,
    ProxyTls, RequestArgs, Route, Target, Transport, TransportKind,
};
use crate::error::Result;
use crate::models::{DatacenterConfig, ProxyConfig, UpstreamProxy};
use crate::proxy::fingerprint::proxy_tls_config;
use crate::proxy::headers::HEADER_PROXYERROR;
use crate::proxy::sockets::TunnelSocketSet;

/// Connect header telling the instance not to count a probe
const HEADER_METRICS: &str = "x-rotor-metrics";

pub struct DatacenterTransport;

impl DatacenterTransport {
    fn config<'a>(&self, proxy: &'a UpstreamProxy) -> Result<&'a DatacenterConfig> {
        match &proxy.config {
            ProxyConfig::Datacenter(config) => Ok(config),
            _ => Err(config_mismatch(proxy, self.kind())),
        }
    }

    fn endpoint(config: &DatacenterConfig) -> Result<Endpoint> {
        let tls = match &config.certificate {
            Some(certificate) => Some(ProxyTls {
                server_name: config.address.hostname.clone(),
                config: proxy_tls_config(Some(certificate))?,
            }),
            None => None,
        };
        Ok(Endpoint {
            address: config.address.clone(),
            tls,
        })
    }
}

impl Transport for DatacenterTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datacenter
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut UpstreamProxy,
        _connector: &ConnectorContext,
    ) -> Result<()> {
        if let ProxyConfig::Raw(value) = &proxy.config {
            let config: DatacenterConfig = parse_raw_config(proxy, value)?;
            proxy.config = ProxyConfig::Datacenter(config);
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
        let config = self.config(proxy)?;

        Ok(RequestArgs {
            method: method.clone(),
            endpoint: Self::endpoint(config)?,
            route: Route::Connect(ConnectStep {
                authority: target.authority(),
                headers: connect_headers,
            }),
            target: target.clone(),
            headers,
            timeout,
            sockets: sockets.clone(),
            error_header: Some(HEADER_PROXYERROR),
        })
    }

    fn build_fingerprint_request_args(
        &self,
        method: &Method,
        target: &Target,
        headers: HeaderMap,
        mut connect_headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<RequestArgs> {
        connect_headers.insert(
            HeaderName::from_static(HEADER_METRICS),
            HeaderValue::from_static("ignore"),
        );
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

    fn build_connect_args(
        &self,
        authority: &str,
        headers: HeaderMap,
        proxy: &UpstreamProxy,
        sockets: &TunnelSocketSet,
        timeout: Duration,
    ) -> Result<ConnectArgs> {
        let config = self.config(proxy)?;

        Ok(ConnectArgs {
            endpoint: Self::endpoint(config)?,
            route: Route::Connect(ConnectStep {
                authority: authority.to_string(),
                headers,
            }),
            timeout,
            sockets: sockets.clone(),
            error_header: Some(HEADER_PROXYERROR),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::certificate::tests::test_ca;
    use hyper::Uri;
    use serde_json::json;

    fn instance(certificate: Option<serde_json::Value>) -> UpstreamProxy {
        let mut raw = json!({ "address": { "hostname": "10.0.0.5", "port": 3128 } });
        if let Some(cert) = certificate {
            raw["certificate"] = cert;
        }
        let mut proxy = UpstreamProxy::new("dc", "i-1", "p1", "datacenter", ProxyConfig::Raw(raw));
        DatacenterTransport
            .complete_proxy_config(&mut proxy, &ConnectorContext::default())
            .unwrap();
        proxy
    }

    #[test]
    fn test_http_target_goes_through_connect() {
        let proxy = instance(None);
        let target = Target::from_uri(&Uri::from_static("http://example.com/x")).unwrap();
        let args = DatacenterTransport
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

        assert!(matches!(args.route, Route::Connect(ref step) if step.authority == "example.com:80"));
        assert!(args.endpoint.tls.is_none());
        assert!(!args.tls_to_target());
        assert_eq!(args.request_uri(), "/x");
        assert_eq!(args.error_header, Some(HEADER_PROXYERROR));
    }

    #[test]
    fn test_certificate_enables_tls_to_instance() {
        let pem = test_ca("instance");
        let proxy = instance(Some(json!({ "cert": pem.cert, "key": pem.key })));
        let args = DatacenterTransport
            .build_connect_args(
                "example.com:443",
                HeaderMap::new(),
                &proxy,
                &TunnelSocketSet::new("test"),
                Duration::from_secs(5),
            )
            .unwrap();

        let tls = args.endpoint.tls.expect("tls to instance");
        assert_eq!(tls.server_name, "10.0.0.5");
        assert!(tls.config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_fingerprint_request_marks_metrics_ignored() {
        let proxy = instance(None);
        let target = Target::from_uri(&Uri::from_static("https://fp.example.com/")).unwrap();
        let args = DatacenterTransport
            .build_fingerprint_request_args(
                &Method::GET,
                &target,
                HeaderMap::new(),
                HeaderMap::new(),
                &proxy,
                &TunnelSocketSet::new("test"),
                Duration::from_secs(5),
            )
            .unwrap();

        match args.route {
            Route::Connect(step) => {
                assert_eq!(step.headers.get(HEADER_METRICS).unwrap(), "ignore");
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_rejects_foreign_config() {
        let proxy = UpstreamProxy::new(
            "dc",
            "i-1",
            "p1",
            "datacenter",
            ProxyConfig::Residential(crate::models::ResidentialConfig {
                address: crate::models::Address::new("gw", 1),
                username: "u".to_string(),
                password: "p".to_string(),
            }),
        );
        assert!(DatacenterTransport
            .build_connect_args(
                "example.com:443",
                HeaderMap::new(),
                &proxy,
                &TunnelSocketSet::new("test"),
                Duration::from_secs(5),
            )
            .is_err());
    }
}
