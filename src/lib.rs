//! Rotor - Master relay for a managed proxy rotation platform
//!
//! Clients authenticate with a project token and send plain HTTP or
//! `CONNECT` requests. The relay picks an upstream proxy for the project,
//! forwards the traffic through it and reports per-proxy metrics.
//!
//! ## Features
//!
//! - Datacenter, residential and user-supplied (http, https, socks) upstreams
//! - Sticky sessions through a header or a cookie
//! - HTTPS interception with per-project certificate authorities
//! - Per-proxy TLS cipher order shuffling
//! - Fingerprint probing of upstream exit IPs

pub mod commander;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{Result, RotorError};
