//! Commander backed by a static JSON inventory

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::Commander;
use crate::error::{Result, RotorError};
use crate::models::{
    ConnectMode, ProjectStatus, ProjectToConnect, ProxyConfig, ProxyMetricsAdd, ProxyStatus,
    UpstreamProxy,
};
use crate::proxy::transport::{ConnectorContext, TransportRegistry};

/// Projects and connectors as written in the inventory file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub projects: Vec<ProjectToConnect>,
    #[serde(default)]
    pub connectors: Vec<InventoryConnector>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConnector {
    pub id: String,
    pub project_id: String,
    pub transport_type: String,
    #[serde(default)]
    pub connector_config: Value,
    #[serde(default)]
    pub credential_config: Value,
    #[serde(default)]
    pub proxies: Vec<InventoryProxy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryProxy {
    pub key: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "started")]
    pub status: ProxyStatus,
    #[serde(default)]
    pub useragent: String,
    #[serde(default)]
    pub timeout_disconnected_ms: Option<u64>,
}

fn started() -> ProxyStatus {
    ProxyStatus::Started
}

/// In-process commander
///
/// Holds projects and proxies in memory and keeps every metrics report it
/// receives.
#[derive(Default)]
pub struct InMemoryCommander {
    projects: RwLock<HashMap<String, ProjectToConnect>>,
    proxies: RwLock<HashMap<String, Vec<Arc<UpstreamProxy>>>>,
    reported: Mutex<Vec<ProxyMetricsAdd>>,
    scale_ups: Mutex<Vec<String>>,
}

impl InMemoryCommander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an inventory, completing every proxy config through its
    /// transport
    pub fn from_inventory(inventory: Inventory, registry: &TransportRegistry) -> Result<Self> {
        let commander = Self::new();

        for project in inventory.projects {
            if project.mitm && project.certificate.is_none() {
                warn!(project_id = %project.id, "MITM enabled without a certificate, tunnelling only");
            }
            commander.add_project(project);
        }

        for connector in inventory.connectors {
            let transport = registry.get_by_name(&connector.transport_type)?;
            let context = ConnectorContext {
                connector_id: connector.id.clone(),
                connector_config: connector.connector_config.clone(),
                credential_config: connector.credential_config.clone(),
            };

            for entry in connector.proxies {
                let mut proxy = UpstreamProxy::new(
                    connector.id.clone(),
                    entry.key,
                    connector.project_id.clone(),
                    connector.transport_type.clone(),
                    ProxyConfig::Raw(entry.config),
                )
                .with_status(entry.status);
                proxy.useragent = entry.useragent;
                if let Some(ms) = entry.timeout_disconnected_ms {
                    proxy.timeout_disconnected = Duration::from_millis(ms);
                }

                transport.complete_proxy_config(&mut proxy, &context)?;
                commander.add_proxy(Arc::new(proxy));
            }
        }

        Ok(commander)
    }

    /// Load an inventory file
    pub async fn load(path: impl AsRef<Path>, registry: &TransportRegistry) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let inventory: Inventory = serde_json::from_str(&raw).map_err(|e| {
            RotorError::InvalidConfig(format!("Invalid inventory {}: {}", path.display(), e))
        })?;

        let commander = Self::from_inventory(inventory, registry)?;
        info!(
            projects = commander.projects.read().len(),
            proxies = commander.proxies.read().values().map(Vec::len).sum::<usize>(),
            "Loaded inventory from {}",
            path.display()
        );
        Ok(commander)
    }

    pub fn add_project(&self, project: ProjectToConnect) {
        self.projects.write().insert(project.id.clone(), project);
    }

    pub fn add_proxy(&self, proxy: Arc<UpstreamProxy>) {
        self.proxies
            .write()
            .entry(proxy.project_id.clone())
            .or_default()
            .push(proxy);
    }

    /// Every proxy of every project
    pub fn all_proxies(&self) -> Vec<Arc<UpstreamProxy>> {
        self.proxies.read().values().flatten().cloned().collect()
    }

    pub fn project(&self, project_id: &str) -> Option<ProjectToConnect> {
        self.projects.read().get(project_id).cloned()
    }

    pub fn reported_metrics(&self) -> Vec<ProxyMetricsAdd> {
        self.reported.lock().clone()
    }

    pub fn scale_up_requests(&self) -> Vec<String> {
        self.scale_ups.lock().clone()
    }
}

#[async_trait]
impl Commander for InMemoryCommander {
    #[instrument(skip(self, token))]
    async fn get_project_to_connect(
        &self,
        token: &str,
        mode: ConnectMode,
        hostname: Option<&str>,
    ) -> Result<ProjectToConnect> {
        let mut project = self
            .projects
            .read()
            .values()
            .find(|p| p.token == token)
            .cloned()
            .ok_or(RotorError::AuthenticationFailed)?;

        if mode == ConnectMode::Tunnel || !project.mitm {
            project.certificate = None;
        }

        debug!(
            project_id = %project.id,
            hostname = hostname.unwrap_or("-"),
            intercept = project.intercepts(),
            "Project resolved"
        );
        Ok(project)
    }

    async fn get_proxies_to_connect(&self, project_id: &str) -> Result<Vec<Arc<UpstreamProxy>>> {
        Ok(self
            .proxies
            .read()
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn scale_up_project(&self, project_id: &str) -> Result<()> {
        self.scale_ups.lock().push(project_id.to_string());
        if let Some(project) = self.projects.write().get_mut(project_id) {
            if project.status == ProjectStatus::Calm {
                project.status = ProjectStatus::Hot;
                info!(project_id, "Project scaled up");
            }
        }
        Ok(())
    }

    async fn add_proxies_metrics(&self, metrics: Vec<ProxyMetricsAdd>) -> Result<()> {
        self.reported.lock().extend(metrics);
        Ok(())
    }
}
