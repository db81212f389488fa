//! Relay implementation
//!
//! This module provides the relay functionality including:
//! - Absolute-form HTTP forwarding through upstream proxies
//! - CONNECT tunnels and MITM interception for HTTPS
//! - Transports for each upstream proxy family
//! - Rotation, stickiness and per-proxy metrics

pub mod certificate;
pub mod fingerprint;
pub mod handler;
pub mod headers;
pub mod metrics;
pub mod middleware;
pub mod mitm;
pub mod probe;
pub mod rotation;
pub mod server;
pub mod sockets;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

pub use handler::{ProxyHandler, RelaySettings};
pub use metrics::MetricsAggregator;
pub use rotation::{create_selector, ProxySelector, RotationPolicy, SessionResolver};
pub use server::ProxyServer;
pub use sockets::TunnelSocketSet;
pub use transport::{Transport, TransportRegistry};
pub use tunnel::TunnelHandler;
