// ABOUTME: Orchestrator settings loaded from SKIFF_* environment variables
// ABOUTME: Covers deployment profile, resource envelope, lifecycle timings and backend paths

use crate::endpoint::{DeploymentProfile, EndpointAllocator, PORT_RANGE_SIZE, PORT_RANGE_START};
use skiff_config::constants::*;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Working directory of the application inside every sandbox
pub const WORKDIR: &str = "/workspace";
/// Where the startup config bundle is mounted inside the sandbox
pub const SCRIPTS_DIR: &str = "/scripts";
/// Sandbox-local state written by the startup script
pub const STATE_DIR: &str = "/tmp/skiff";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid deployment profile: {0}")]
    InvalidProfile(String),
    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: String, value: String },
    #[error("Port range {start}+{size} exceeds 65535")]
    PortRangeOverflow { start: u16, size: u16 },
    #[error("{0} must not be empty")]
    Empty(String),
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    // Endpoint allocation
    pub profile: DeploymentProfile,
    pub base_domain: String,
    pub app_port: u16,
    pub port_range_start: u16,
    pub port_range_size: u16,
    pub label_prefix: String,

    // Resource envelope
    pub memory_request_mb: u64,
    pub memory_limit_mb: u64,
    pub cpu_request_millis: u64,
    pub cpu_limit_millis: u64,

    // Lifecycle timings
    pub delete_grace: Duration,
    pub restart_grace: Duration,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub startup_wait: Duration,
    pub supervisor_backoff: Duration,

    // Status registry
    pub status_expiry: Duration,
    pub sweep_interval: Duration,

    /// npm registry preset name or URL, applied to node sandboxes
    pub npm_registry: Option<String>,

    // Docker backend
    pub config_root: PathBuf,
    pub routes_dir: PathBuf,
    pub route_entrypoint: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            profile: DeploymentProfile::Local,
            base_domain: "localhost".to_string(),
            app_port: 3000,
            port_range_start: PORT_RANGE_START,
            port_range_size: PORT_RANGE_SIZE,
            label_prefix: "skiff.sandbox".to_string(),
            memory_request_mb: 256,
            memory_limit_mb: 512,
            cpu_request_millis: 200,
            cpu_limit_millis: 500,
            delete_grace: Duration::from_secs(2),
            restart_grace: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(120),
            ready_poll_interval: Duration::from_millis(500),
            startup_wait: Duration::from_secs(300),
            supervisor_backoff: Duration::from_secs(2),
            status_expiry: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            npm_registry: None,
            config_root: env::temp_dir().join("skiff").join("configs"),
            routes_dir: env::temp_dir().join("skiff").join("routes"),
            route_entrypoint: "websecure".to_string(),
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let profile = match env::var(SKIFF_PROFILE) {
            Ok(value) => value.parse::<DeploymentProfile>()?,
            Err(_) => defaults.profile,
        };

        let base_domain = env::var(SKIFF_BASE_DOMAIN).unwrap_or(defaults.base_domain);
        if base_domain.trim().is_empty() {
            return Err(ConfigError::Empty(SKIFF_BASE_DOMAIN.to_string()));
        }

        let port_range_start = parse_var(SKIFF_PORT_RANGE_START, defaults.port_range_start)?;
        let port_range_size = parse_var(SKIFF_PORT_RANGE_SIZE, defaults.port_range_size)?;
        if port_range_size == 0 {
            return Err(ConfigError::InvalidNumber {
                var: SKIFF_PORT_RANGE_SIZE.to_string(),
                value: "0".to_string(),
            });
        }
        if u32::from(port_range_start) + u32::from(port_range_size) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::PortRangeOverflow {
                start: port_range_start,
                size: port_range_size,
            });
        }

        let npm_registry = env::var(SKIFF_NPM_REGISTRY)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            profile,
            base_domain,
            app_port: parse_var(SKIFF_APP_PORT, defaults.app_port)?,
            port_range_start,
            port_range_size,
            label_prefix: env::var(SKIFF_LABEL_PREFIX).unwrap_or(defaults.label_prefix),
            memory_request_mb: parse_var(SKIFF_MEMORY_REQUEST_MB, defaults.memory_request_mb)?,
            memory_limit_mb: parse_var(SKIFF_MEMORY_LIMIT_MB, defaults.memory_limit_mb)?,
            cpu_request_millis: parse_var(SKIFF_CPU_REQUEST_MILLIS, defaults.cpu_request_millis)?,
            cpu_limit_millis: parse_var(SKIFF_CPU_LIMIT_MILLIS, defaults.cpu_limit_millis)?,
            delete_grace: millis_var(SKIFF_DELETE_GRACE_MS, defaults.delete_grace)?,
            restart_grace: millis_var(SKIFF_RESTART_GRACE_MS, defaults.restart_grace)?,
            ready_timeout: secs_var(SKIFF_READY_TIMEOUT_SECS, defaults.ready_timeout)?,
            ready_poll_interval: millis_var(SKIFF_READY_POLL_MS, defaults.ready_poll_interval)?,
            startup_wait: secs_var(SKIFF_STARTUP_WAIT_SECS, defaults.startup_wait)?,
            supervisor_backoff: secs_var(
                SKIFF_SUPERVISOR_BACKOFF_SECS,
                defaults.supervisor_backoff,
            )?,
            status_expiry: Duration::from_secs(
                parse_var(
                    SKIFF_STATUS_EXPIRY_HOURS,
                    defaults.status_expiry.as_secs() / 3600,
                )? * 3600,
            ),
            sweep_interval: secs_var(SKIFF_STATUS_SWEEP_SECS, defaults.sweep_interval)?,
            npm_registry,
            config_root: env::var(SKIFF_CONFIG_ROOT)
                .map(PathBuf::from)
                .unwrap_or(defaults.config_root),
            routes_dir: env::var(SKIFF_ROUTES_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.routes_dir),
            route_entrypoint: env::var(SKIFF_ROUTE_ENTRYPOINT)
                .unwrap_or(defaults.route_entrypoint),
        })
    }

    /// Default settings with every wait zeroed, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            delete_grace: Duration::ZERO,
            restart_grace: Duration::ZERO,
            ready_timeout: Duration::from_secs(5),
            ready_poll_interval: Duration::from_millis(5),
            ..Self::default()
        }
    }

    pub fn allocator(&self) -> EndpointAllocator {
        EndpointAllocator::new(
            self.profile,
            self.base_domain.clone(),
            self.port_range_start,
            self.port_range_size,
        )
    }

    pub fn label(&self, key: &str) -> String {
        format!("{}.{}", self.label_prefix, key)
    }
}

fn parse_var<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidNumber {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn millis_var(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(var, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_var(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(var, default.as_secs()).map(Duration::from_secs)
}
