use serde::{Deserialize, Serialize};

use crate::models::CertificatePem;
use crate::proxy::rotation::RotationPolicy;

/// Scaling status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Off,
    #[default]
    Calm,
    Hot,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Off => "off",
            ProjectStatus::Calm => "calm",
            ProjectStatus::Hot => "hot",
        }
    }
}

/// How the client asked the relay to handle HTTPS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Project default: intercept when the project has MITM enabled
    #[default]
    Default,
    /// Never decrypt
    Tunnel,
}

impl ConnectMode {
    /// Parse the client's mode header value. Unknown values keep the default.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "tunnel" => ConnectMode::Tunnel,
            _ => ConnectMode::Default,
        }
    }
}

/// Everything the relay needs to know about the project behind a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectToConnect {
    pub id: String,
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub mitm: bool,
    /// Project CA used to sign MITM leaves. Only set when the relay
    /// should intercept this connection.
    #[serde(default)]
    pub certificate: Option<CertificatePem>,
    #[serde(default)]
    pub ciphers_shuffle: bool,
    #[serde(default)]
    pub auto_scale_up: bool,
    #[serde(default)]
    pub cookie_session: bool,
    #[serde(default)]
    pub useragent_override: bool,
    #[serde(default)]
    pub rotation: RotationPolicy,
    #[serde(default)]
    pub max_connections_per_proxy: Option<usize>,
}

impl ProjectToConnect {
    pub fn is_active(&self) -> bool {
        self.status != ProjectStatus::Off
    }

    /// Should HTTPS connections of this project be decrypted
    pub fn intercepts(&self) -> bool {
        self.certificate.is_some()
    }
}
