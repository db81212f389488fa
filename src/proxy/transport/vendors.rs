//! Vendor gateway transports
//!
//! Vendors speak the residential wire protocol; they differ in gateway
//! address and in how session credentials are encoded.

use std::time::Duration;

use hyper::header::HeaderMap;
use hyper::Method;
use serde::Deserialize;

use super::residential::{gateway_connect_args, gateway_request_args, residential_config};
use super::{
    parse_raw_config, ConnectArgs, ConnectorContext, RequestArgs, Target, Transport,
    TransportKind,
};
use crate::error::{Result, RotorError};
use crate::models::{Address, ProxyConfig, ResidentialConfig, UpstreamProxy};
use crate::proxy::sockets::TunnelSocketSet;

const NETNUT_GATEWAY: (&str, u16) = ("gw.ntnt.io", 5959);
const NETNUT_ERROR_HEADER: &str = "x-squid-error";

const IPROYAL_GATEWAY: (&str, u16) = ("geo.iproyal.com", 12321);

#[derive(Debug, Clone, Deserialize)]
struct Credential {
    username: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetnutConnectorConfig {
    proxy_type: String,
    country: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IproyalConnectorConfig {
    lifetime: String,
    country: String,
    #[serde(default = "all")]
    state: String,
    #[serde(default = "all")]
    city: String,
    #[serde(default)]
    high_end_pool: bool,
}

fn all() -> String {
    "all".to_string()
}

/// First run of digits in the proxy key; zero is not a session
fn netnut_session(key: &str) -> Option<u64> {
    let digits: String = key
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().filter(|s| *s > 0)
}

fn netnut_username(username: &str, proxy_type: &str, country: &str, session: u64) -> String {
    let country = country.to_lowercase();
    let country = if proxy_type == "mob" && country == "us" {
        "row".to_string()
    } else {
        country
    };
    format!("{}-{}-{}-sid-{}", username, proxy_type, country, session)
}

fn iproyal_password(password: &str, session: &str, config: &IproyalConnectorConfig) -> String {
    let mut parts = vec![
        password.to_string(),
        format!("session-{}", session),
        format!("lifetime-{}", config.lifetime),
    ];

    if config.country != "all" {
        parts.push(format!("country-{}", config.country.to_uppercase()));
        if config.state != "all" {
            parts.push(format!("state-{}", config.state));
        }
        if config.city != "all" {
            parts.push(format!("city-{}", config.city));
        }
    }

    if config.high_end_pool {
        parts.push("streaming-1".to_string());
    }

    parts.join("_")
}

/// Netnut residential and mobile gateway
pub struct NetnutTransport;

impl Transport for NetnutTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Netnut
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut UpstreamProxy,
        connector: &ConnectorContext,
    ) -> Result<()> {
        let config: NetnutConnectorConfig = parse_raw_config(proxy, &connector.connector_config)?;
        let credential: Credential = parse_raw_config(proxy, &connector.credential_config)?;

        let session = netnut_session(&proxy.key).ok_or_else(|| {
            RotorError::InvalidConfig(format!("Invalid session key for proxy {}", proxy.id))
        })?;

        proxy.config = ProxyConfig::Residential(ResidentialConfig {
            address: Address::new(NETNUT_GATEWAY.0, NETNUT_GATEWAY.1),
            username: netnut_username(
                &credential.username,
                &config.proxy_type,
                &config.country,
                session,
            ),
            password: credential.password,
        });
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
            Some(NETNUT_ERROR_HEADER),
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
        gateway_connect_args(
            config,
            authority,
            headers,
            sockets,
            timeout,
            Some(NETNUT_ERROR_HEADER),
        )
    }
}

/// IPRoyal residential gateway
pub struct IproyalTransport;

impl Transport for IproyalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Iproyal
    }

    fn complete_proxy_config(
        &self,
        proxy: &mut UpstreamProxy,
        connector: &ConnectorContext,
    ) -> Result<()> {
        let config: IproyalConnectorConfig =
            parse_raw_config(proxy, &connector.connector_config)?;
        let credential: Credential = parse_raw_config(proxy, &connector.credential_config)?;

        proxy.config = ProxyConfig::Residential(ResidentialConfig {
            address: Address::new(IPROYAL_GATEWAY.0, IPROYAL_GATEWAY.1),
            username: credential.username,
            password: iproyal_password(&credential.password, &proxy.key, &config),
        });
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(connector_config: serde_json::Value) -> ConnectorContext {
        ConnectorContext {
            connector_id: "conn".to_string(),
            connector_config,
            credential_config: json!({ "username": "alice", "password": "pw" }),
        }
    }

    fn residential(proxy: &UpstreamProxy) -> &ResidentialConfig {
        match &proxy.config {
            ProxyConfig::Residential(config) => config,
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_netnut_session_from_key() {
        assert_eq!(netnut_session("proxy-42-x7"), Some(42));
        assert_eq!(netnut_session("17"), Some(17));
        assert_eq!(netnut_session("abc"), None);
        assert_eq!(netnut_session("s0"), None);
        assert_eq!(netnut_session(""), None);
    }

    #[test]
    fn test_netnut_complete_proxy_config() {
        let mut proxy = UpstreamProxy::new("conn", "s123", "p1", "netnut", ProxyConfig::default());
        NetnutTransport
            .complete_proxy_config(&mut proxy, &context(json!({ "proxyType": "res", "country": "FR" })))
            .unwrap();

        let config = residential(&proxy);
        assert_eq!(config.address, Address::new("gw.ntnt.io", 5959));
        assert_eq!(config.username, "alice-res-fr-sid-123");
        assert_eq!(config.password, "pw");
    }

    #[test]
    fn test_netnut_mobile_us_becomes_row() {
        let mut proxy = UpstreamProxy::new("conn", "9", "p1", "netnut", ProxyConfig::default());
        NetnutTransport
            .complete_proxy_config(&mut proxy, &context(json!({ "proxyType": "mob", "country": "US" })))
            .unwrap();

        assert_eq!(residential(&proxy).username, "alice-mob-row-sid-9");
    }

    #[test]
    fn test_netnut_invalid_key() {
        let mut proxy = UpstreamProxy::new("conn", "nokey", "p1", "netnut", ProxyConfig::default());
        let err = NetnutTransport
            .complete_proxy_config(&mut proxy, &context(json!({ "proxyType": "res", "country": "fr" })))
            .unwrap_err();
        assert!(matches!(err, RotorError::InvalidConfig(_)));
    }

    #[test]
    fn test_netnut_error_header() {
        let mut proxy = UpstreamProxy::new("conn", "1", "p1", "netnut", ProxyConfig::default());
        NetnutTransport
            .complete_proxy_config(&mut proxy, &context(json!({ "proxyType": "res", "country": "fr" })))
            .unwrap();

        let args = NetnutTransport
            .build_connect_args(
                "example.com:443",
                HeaderMap::new(),
                &proxy,
                &TunnelSocketSet::new("test"),
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(args.error_header, Some("x-squid-error"));
    }

    #[test]
    fn test_iproyal_password_all() {
        let mut proxy = UpstreamProxy::new("conn", "abc", "p1", "iproyal", ProxyConfig::default());
        IproyalTransport
            .complete_proxy_config(&mut proxy, &context(json!({ "lifetime": "24h", "country": "all" })))
            .unwrap();

        let config = residential(&proxy);
        assert_eq!(config.address, Address::new("geo.iproyal.com", 12321));
        assert_eq!(config.username, "alice");
        assert_eq!(config.password, "pw_session-abc_lifetime-24h");
    }

    #[test]
    fn test_iproyal_password_geo() {
        let mut proxy = UpstreamProxy::new("conn", "abc", "p1", "iproyal", ProxyConfig::default());
        IproyalTransport
            .complete_proxy_config(
                &mut proxy,
                &context(json!({
                    "lifetime": "1h",
                    "country": "us",
                    "state": "texas",
                    "city": "austin",
                    "highEndPool": true
                })),
            )
            .unwrap();

        assert_eq!(
            residential(&proxy).password,
            "pw_session-abc_lifetime-1h_country-US_state-texas_city-austin_streaming-1"
        );
    }

    #[test]
    fn test_iproyal_requires_connector_config() {
        let mut proxy = UpstreamProxy::new("conn", "abc", "p1", "iproyal", ProxyConfig::default());
        assert!(IproyalTransport
            .complete_proxy_config(&mut proxy, &context(serde_json::Value::Null))
            .is_err());
    }
}
