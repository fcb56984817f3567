// ABOUTME: Deterministic network endpoint allocation per project
// ABOUTME: Derives host ports, routable hostnames and resource names from a project id

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::settings::ConfigError;

pub const PORT_RANGE_START: u16 = 30000;
pub const PORT_RANGE_SIZE: u16 = 2768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentProfile {
    /// Sandboxes are reached through a host port on localhost
    Local,
    /// Sandboxes are reached through a public route under a base domain
    Production,
}

impl FromStr for DeploymentProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "development" | "dev" => Ok(DeploymentProfile::Local),
            "production" | "prod" => Ok(DeploymentProfile::Production),
            _ => Err(ConfigError::InvalidProfile(s.to_string())),
        }
    }
}

impl fmt::Display for DeploymentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentProfile::Local => write!(f, "local"),
            DeploymentProfile::Production => write!(f, "production"),
        }
    }
}

/// Rolling 31-multiplier hash over UTF-16 code units, folded into the port range.
///
/// Arithmetic wraps at 32 bits so the same id always lands on the same port.
pub fn port_for(project_id: &str) -> u16 {
    port_in_range(project_id, PORT_RANGE_START, PORT_RANGE_SIZE)
}

pub fn port_in_range(project_id: &str, start: u16, size: u16) -> u16 {
    let hash = project_id
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_mul(31).wrapping_add(unit as i32)
        });
    let size = u32::from(size.max(1));
    start.saturating_add((hash.unsigned_abs() % size) as u16)
}

/// Hostname for a project under `base_domain`: alphanumerics only, lowercased.
pub fn host_for(project_id: &str, base_domain: &str) -> String {
    let label: String = project_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("{}.{}", label, base_domain)
}

pub fn sandbox_name(project_id: &str) -> String {
    format!("code-editor-{}", project_id)
}

pub fn endpoint_name(project_id: &str) -> String {
    format!("code-editor-service-{}", project_id)
}

pub fn route_name(project_id: &str) -> String {
    format!("code-editor-ingress-{}", project_id)
}

pub fn startup_config_name(project_id: &str) -> String {
    format!("startup-script-{}", project_id)
}

/// Profile-aware view over the pure allocation functions.
#[derive(Debug, Clone)]
pub struct EndpointAllocator {
    profile: DeploymentProfile,
    base_domain: String,
    port_start: u16,
    port_range: u16,
}

impl EndpointAllocator {
    pub fn new(
        profile: DeploymentProfile,
        base_domain: impl Into<String>,
        port_start: u16,
        port_range: u16,
    ) -> Self {
        Self {
            profile,
            base_domain: base_domain.into(),
            port_start,
            port_range,
        }
    }

    pub fn profile(&self) -> DeploymentProfile {
        self.profile
    }

    pub fn port_for(&self, project_id: &str) -> u16 {
        port_in_range(project_id, self.port_start, self.port_range)
    }

    pub fn host_for(&self, project_id: &str) -> String {
        host_for(project_id, &self.base_domain)
    }

    pub fn endpoint_url(&self, project_id: &str) -> String {
        match self.profile {
            DeploymentProfile::Local => format!("http://localhost:{}", self.port_for(project_id)),
            DeploymentProfile::Production => format!("https://{}", self.host_for(project_id)),
        }
    }
}
