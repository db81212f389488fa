//! Transport registry
//!
//! Maps a [`TransportKind`] to the implementation that reaches proxies of
//! that family. Lookups are lock-free; registration swaps in a new map.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use super::{
    DatacenterTransport, IproyalTransport, NetnutTransport, ProxyTransport, ResidentialTransport,
    Transport, TransportKind,
};
use crate::error::{Result, RotorError};

type TransportMap = HashMap<TransportKind, Arc<dyn Transport>>;

pub struct TransportRegistry {
    transports: ArcSwap<TransportMap>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Registry holding every built-in transport
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(DatacenterTransport));
        registry.register(Arc::new(ResidentialTransport));
        registry.register(Arc::new(NetnutTransport));
        registry.register(Arc::new(IproyalTransport));
        registry.register(Arc::new(ProxyTransport));
        registry
    }

    /// Add or replace the transport for its kind
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let kind = transport.kind();
        self.transports.rcu(|current| {
            let mut next = TransportMap::clone(current);
            next.insert(kind, transport.clone());
            next
        });
        debug!(transport = %kind, "Registered transport");
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        self.transports
            .load()
            .get(&kind)
            .cloned()
            .ok_or_else(|| RotorError::TransportNotFound(kind.to_string()))
    }

    /// Look up by the `transport_type` tag carried by a proxy
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Transport>> {
        self.get(name.parse::<TransportKind>()?)
    }

    pub fn len(&self) -> usize {
        self.transports.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
