// ABOUTME: Cluster backend trait and resource descriptions shared by all backends
// ABOUTME: Defines the management API the orchestrator drives (sandboxes, endpoints, routes, configs, exec)

use crate::error::BackendError;
use crate::startup::{script_runtime, Runtime, STARTUP_SCRIPT_FILE};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

pub mod docker;
pub mod memory;

pub use docker::DockerBackend;
pub use memory::MemoryBackend;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Lifecycle phase of a compute unit as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl SandboxPhase {
    /// Phases that `ensure_sandbox` keeps as-is
    pub fn is_healthy(&self) -> bool {
        matches!(self, SandboxPhase::Pending | SandboxPhase::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SandboxPhase::Failed)
    }
}

/// Everything needed to create one sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub project_id: String,
    pub runtime: Runtime,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    pub workdir: String,
    /// Name of the startup config bundle to mount read-only
    pub startup_config: String,
    pub config_mount: String,
    pub app_port: u16,
    /// Host port to publish the app port on, local profile only
    pub host_port: Option<u16>,
    pub memory_request_mb: u64,
    pub memory_limit_mb: u64,
    pub cpu_request_millis: u64,
    pub cpu_limit_millis: u64,
}

#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub name: String,
    pub phase: SandboxPhase,
    pub ready: bool,
    pub labels: HashMap<String, String>,
    pub waiting_reason: Option<String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SandboxInfo {
    pub fn runtime(&self, label_key: &str) -> Option<Runtime> {
        self.labels.get(label_key).map(|name| Runtime::from_name(name))
    }
}

#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub project_id: String,
    pub port: u16,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointInfo {
    pub name: String,
    pub attached: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub name: String,
    pub project_id: String,
    pub host: String,
    pub endpoint: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteInfo {
    pub name: String,
    pub host: String,
}

/// Immutable bundle of bootstrap files, keyed by file name
#[derive(Debug, Clone)]
pub struct StartupConfigSpec {
    pub name: String,
    pub project_id: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartupConfigInfo {
    pub name: String,
    pub files: Vec<String>,
    /// Runtime named in the bootstrap script header, if the bundle has one
    pub runtime: Option<Runtime>,
}

impl StartupConfigInfo {
    pub fn from_files(name: &str, files: &BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            files: files.keys().cloned().collect(),
            runtime: files.get(STARTUP_SCRIPT_FILE).and_then(|s| script_runtime(s)),
        }
    }

    /// Whether sandboxes of `runtime` can boot from this bundle
    pub fn boots(&self, runtime: Runtime) -> bool {
        self.runtime == Some(runtime) && self.files.iter().any(|f| f == STARTUP_SCRIPT_FILE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, lossily decoded
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }
}

/// Management API of the container platform hosting the sandboxes.
///
/// Reads return `BackendError::NotFound` for absent resources and creates return
/// `BackendError::Conflict` when the name is taken. Callers rely on both.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Check that the backend is reachable
    async fn ping(&self) -> Result<()>;

    async fn get_sandbox(&self, name: &str) -> Result<SandboxInfo>;

    /// Create and start a sandbox
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxInfo>;

    async fn delete_sandbox(&self, name: &str) -> Result<()>;

    /// List sandboxes carrying `label=value`
    async fn list_sandboxes(&self, label: &str, value: &str) -> Result<Vec<SandboxInfo>>;

    async fn get_endpoint(&self, name: &str) -> Result<EndpointInfo>;

    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<EndpointInfo>;

    async fn delete_endpoint(&self, name: &str) -> Result<()>;

    /// Make `sandbox` reachable through `endpoint`. Backends that select by label need nothing here.
    async fn attach_endpoint(&self, _endpoint: &str, _sandbox: &str) -> Result<()> {
        Ok(())
    }

    async fn get_route(&self, name: &str) -> Result<RouteInfo>;

    async fn create_route(&self, spec: &RouteSpec) -> Result<RouteInfo>;

    async fn delete_route(&self, name: &str) -> Result<()>;

    async fn get_startup_config(&self, name: &str) -> Result<StartupConfigInfo>;

    async fn create_startup_config(&self, spec: &StartupConfigSpec) -> Result<StartupConfigInfo>;

    async fn delete_startup_config(&self, name: &str) -> Result<()>;

    /// Run a command in the sandbox's primary container and wait for it to exit
    async fn exec(&self, sandbox: &str, command: &[String]) -> Result<ExecOutput>;

    /// Extract a tar archive into `dest_dir` inside the sandbox
    async fn upload_archive(&self, sandbox: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()>;

    /// Last `tail` lines of the sandbox's output
    async fn logs(&self, sandbox: &str, tail: usize) -> Result<String>;
}
