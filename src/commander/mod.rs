//! Commander collaborator
//!
//! The relay never owns projects or proxies. It asks the commander which
//! project a token belongs to, which proxies are live for it, and reports
//! traffic back.

mod memory;

pub use memory::{Inventory, InventoryConnector, InventoryProxy, InMemoryCommander};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ConnectMode, ProjectToConnect, ProxyMetricsAdd, UpstreamProxy};

#[async_trait]
pub trait Commander: Send + Sync {
    /// Project behind `token`, with the CA certificate only when the
    /// connection should be intercepted
    async fn get_project_to_connect(
        &self,
        token: &str,
        mode: ConnectMode,
        hostname: Option<&str>,
    ) -> Result<ProjectToConnect>;

    async fn get_proxies_to_connect(&self, project_id: &str) -> Result<Vec<Arc<UpstreamProxy>>>;

    async fn scale_up_project(&self, project_id: &str) -> Result<()>;

    async fn add_proxies_metrics(&self, metrics: Vec<ProxyMetricsAdd>) -> Result<()>;
}
