// ABOUTME: Idempotent provisioning and teardown of per-project cluster resources
// ABOUTME: Get-or-create for sandboxes, endpoints, routes and startup configs; deletes tolerate absence

use crate::backend::{
    ClusterBackend, EndpointInfo, EndpointSpec, RouteInfo, RouteSpec, SandboxInfo, SandboxPhase,
    SandboxSpec, StartupConfigInfo, StartupConfigSpec,
};
use crate::endpoint::{
    endpoint_name, route_name, sandbox_name, startup_config_name, DeploymentProfile,
    EndpointAllocator,
};
use crate::error::{BackendError, Result};
use crate::settings::{SandboxSettings, SCRIPTS_DIR, WORKDIR};
use crate::startup::{generate_startup_script, Runtime, STARTUP_SCRIPT_FILE};
use crate::status::ContainerStatus;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the backend currently reports for a project's sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxObservation {
    Absent,
    Present {
        phase: SandboxPhase,
        ready: bool,
        waiting_reason: Option<String>,
        runtime: Option<Runtime>,
    },
}

impl SandboxObservation {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SandboxObservation::Present {
                phase: SandboxPhase::Running,
                ..
            }
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            SandboxObservation::Present {
                phase: SandboxPhase::Running,
                ready: true,
                ..
            }
        )
    }

    pub fn runtime(&self) -> Option<Runtime> {
        match self {
            SandboxObservation::Present { runtime, .. } => *runtime,
            SandboxObservation::Absent => None,
        }
    }

    /// Translate the backend view into the logical status reported to callers
    pub fn logical_status(&self) -> (ContainerStatus, String) {
        let (phase, ready, waiting_reason) = match self {
            SandboxObservation::Absent => {
                return (ContainerStatus::Stopped, "Sandbox not created".to_string())
            }
            SandboxObservation::Present {
                phase,
                ready,
                waiting_reason,
                ..
            } => (phase, *ready, waiting_reason),
        };

        let (status, message) = match phase {
            SandboxPhase::Pending => (ContainerStatus::Creating, "Sandbox is starting"),
            SandboxPhase::Running if !ready => {
                (ContainerStatus::Creating, "Sandbox is running but not ready")
            }
            SandboxPhase::Running => (ContainerStatus::Running, "Sandbox is running"),
            SandboxPhase::Failed => (ContainerStatus::Error, "Sandbox failed"),
            SandboxPhase::Unknown => (ContainerStatus::Error, "Sandbox state unknown"),
            SandboxPhase::Succeeded => (ContainerStatus::Stopped, "Sandbox exited"),
        };

        match waiting_reason {
            Some(reason) => (status, format!("{} ({})", message, reason)),
            None => (status, message.to_string()),
        }
    }
}

/// Outcome of a best-effort teardown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub absent: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, name: String, result: std::result::Result<(), BackendError>) {
        match result {
            Ok(()) => self.removed.push(name),
            Err(e) if e.is_not_found() => self.absent.push(name),
            Err(e) => {
                warn!("Failed to delete {}: {}", name, e);
                self.failed.push((name, e.to_string()));
            }
        }
    }
}

pub struct ResourceController {
    backend: Arc<dyn ClusterBackend>,
    settings: Arc<SandboxSettings>,
    allocator: EndpointAllocator,
}

impl ResourceController {
    pub fn new(backend: Arc<dyn ClusterBackend>, settings: impl Into<Arc<SandboxSettings>>) -> Self {
        let settings = settings.into();
        let allocator = settings.allocator();
        Self {
            backend,
            settings,
            allocator,
        }
    }

    pub fn allocator(&self) -> &EndpointAllocator {
        &self.allocator
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    fn labels(&self, project_id: &str, runtime: Runtime) -> HashMap<String, String> {
        HashMap::from([
            ("app".to_string(), "code-editor".to_string()),
            (self.settings.label("managed"), "true".to_string()),
            (self.settings.label("project-id"), project_id.to_string()),
            (self.settings.label("runtime"), runtime.as_str().to_string()),
        ])
    }

    pub fn sandbox_spec(&self, project_id: &str, runtime: Runtime) -> SandboxSpec {
        let settings = &self.settings;
        let env = BTreeMap::from([
            ("PROJECT_ID".to_string(), project_id.to_string()),
            ("NODE_ENV".to_string(), "development".to_string()),
            ("PORT".to_string(), settings.app_port.to_string()),
        ]);

        SandboxSpec {
            name: sandbox_name(project_id),
            project_id: project_id.to_string(),
            runtime,
            image: runtime.image().to_string(),
            command: vec![
                "sh".to_string(),
                format!("{}/{}", SCRIPTS_DIR, STARTUP_SCRIPT_FILE),
            ],
            env,
            labels: self.labels(project_id, runtime),
            workdir: WORKDIR.to_string(),
            startup_config: startup_config_name(project_id),
            config_mount: SCRIPTS_DIR.to_string(),
            app_port: settings.app_port,
            host_port: match self.allocator.profile() {
                DeploymentProfile::Local => Some(self.allocator.port_for(project_id)),
                DeploymentProfile::Production => None,
            },
            memory_request_mb: settings.memory_request_mb,
            memory_limit_mb: settings.memory_limit_mb,
            cpu_request_millis: settings.cpu_request_millis,
            cpu_limit_millis: settings.cpu_limit_millis,
        }
    }

    /// Get-or-create the immutable bootstrap bundle for a project.
    ///
    /// A bundle written for another runtime, or missing its script, is replaced.
    /// Only call this while the project has no sandbox mounting the bundle.
    pub async fn ensure_startup_config(
        &self,
        project_id: &str,
        runtime: Runtime,
    ) -> Result<StartupConfigInfo> {
        let name = startup_config_name(project_id);
        match self.backend.get_startup_config(&name).await {
            Ok(existing) if existing.boots(runtime) => return Ok(existing),
            Ok(existing) => {
                warn!(
                    "Startup config {} was written for {:?}, replacing it for {}",
                    name, existing.runtime, runtime
                );
                absent_is_ok(self.backend.delete_startup_config(&name).await)?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!("Creating startup config {} ({})", name, runtime);
        let spec = StartupConfigSpec {
            name: name.clone(),
            project_id: project_id.to_string(),
            files: BTreeMap::from([(
                STARTUP_SCRIPT_FILE.to_string(),
                generate_startup_script(runtime, &self.settings),
            )]),
        };
        match self.backend.create_startup_config(&spec).await {
            Ok(created) => Ok(created),
            Err(e) if e.is_conflict() => Ok(self.backend.get_startup_config(&name).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Get-or-create the project's sandbox.
    ///
    /// A pending or running sandbox is returned untouched. Any other phase is deleted
    /// and recreated after `delete_grace`. Losing a creation race returns the winner's sandbox.
    pub async fn ensure_sandbox(&self, project_id: &str, runtime: Runtime) -> Result<SandboxInfo> {
        let name = sandbox_name(project_id);

        match self.backend.get_sandbox(&name).await {
            Ok(existing) if !existing.phase.is_healthy() => {
                warn!("Sandbox {} is {:?}, recreating", name, existing.phase);
                self.delete_sandbox(project_id).await?;
                tokio::time::sleep(self.settings.delete_grace).await;
            }
            Ok(existing) => {
                debug!("Sandbox {} already exists ({:?})", name, existing.phase);
                return Ok(existing);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.ensure_startup_config(project_id, runtime).await?;

        info!("Creating sandbox {} with image {}", name, runtime.image());
        let spec = self.sandbox_spec(project_id, runtime);
        match self.backend.create_sandbox(&spec).await {
            Ok(created) => Ok(created),
            Err(e) if e.is_conflict() => {
                debug!("Sandbox {} created concurrently, reusing it", name);
                Ok(self.backend.get_sandbox(&name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_sandbox(&self, project_id: &str) -> Result<()> {
        let name = sandbox_name(project_id);
        match self.backend.delete_sandbox(&name).await {
            Ok(()) => {
                info!("Deleted sandbox {}", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_sandbox(&self, project_id: &str) -> Result<Option<SandboxInfo>> {
        match self.backend.get_sandbox(&sandbox_name(project_id)).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Backend view of the sandbox; absence is a value, not an error
    pub async fn get_sandbox_status(&self, project_id: &str) -> Result<SandboxObservation> {
        let runtime_label = self.settings.label("runtime");
        Ok(match self.get_sandbox(project_id).await? {
            Some(info) => SandboxObservation::Present {
                phase: info.phase,
                ready: info.ready,
                runtime: info.runtime(&runtime_label),
                waiting_reason: info.waiting_reason,
            },
            None => SandboxObservation::Absent,
        })
    }

    pub async fn sandbox_logs(&self, project_id: &str, tail: usize) -> Result<String> {
        Ok(self.backend.logs(&sandbox_name(project_id), tail).await?)
    }

    /// Get-or-create the stable endpoint and attach the sandbox to it if present
    pub async fn ensure_network_endpoint(&self, project_id: &str) -> Result<EndpointInfo> {
        let name = endpoint_name(project_id);

        let endpoint = match self.backend.get_endpoint(&name).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                info!("Creating network endpoint {}", name);
                let labels = HashMap::from([
                    (self.settings.label("managed"), "true".to_string()),
                    (self.settings.label("project-id"), project_id.to_string()),
                ]);
                let spec = EndpointSpec {
                    name: name.clone(),
                    project_id: project_id.to_string(),
                    port: self.settings.app_port,
                    labels,
                };
                match self.backend.create_endpoint(&spec).await {
                    Ok(created) => created,
                    Err(e) if e.is_conflict() => self.backend.get_endpoint(&name).await?,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        match self
            .backend
            .attach_endpoint(&name, &sandbox_name(project_id))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("No sandbox to attach to {} yet", name);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(endpoint)
    }

    /// Get-or-create the public route. Only the production profile has one.
    pub async fn ensure_public_route(&self, project_id: &str) -> Result<Option<RouteInfo>> {
        if self.allocator.profile() != DeploymentProfile::Production {
            return Ok(None);
        }

        let name = route_name(project_id);
        match self.backend.get_route(&name).await {
            Ok(existing) => return Ok(Some(existing)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let spec = RouteSpec {
            name: name.clone(),
            project_id: project_id.to_string(),
            host: self.allocator.host_for(project_id),
            endpoint: endpoint_name(project_id),
            port: self.settings.app_port,
        };
        info!("Creating public route {} for {}", name, spec.host);
        match self.backend.create_route(&spec).await {
            Ok(created) => Ok(Some(created)),
            Err(e) if e.is_conflict() => Ok(Some(self.backend.get_route(&name).await?)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_network_endpoint(&self, project_id: &str) -> Result<()> {
        absent_is_ok(self.backend.delete_endpoint(&endpoint_name(project_id)).await)
    }

    pub async fn delete_public_route(&self, project_id: &str) -> Result<()> {
        absent_is_ok(self.backend.delete_route(&route_name(project_id)).await)
    }

    pub async fn delete_startup_config(&self, project_id: &str) -> Result<()> {
        absent_is_ok(
            self.backend
                .delete_startup_config(&startup_config_name(project_id))
                .await,
        )
    }

    /// Delete every resource of a project, continuing past individual failures
    pub async fn cleanup_project(&self, project_id: &str) -> CleanupReport {
        info!("Cleaning up resources for project {}", project_id);
        let mut report = CleanupReport::default();

        let name = sandbox_name(project_id);
        let result = self.backend.delete_sandbox(&name).await;
        report.record(name, result);

        let name = endpoint_name(project_id);
        let result = self.backend.delete_endpoint(&name).await;
        report.record(name, result);

        let name = startup_config_name(project_id);
        let result = self.backend.delete_startup_config(&name).await;
        report.record(name, result);

        let name = route_name(project_id);
        let result = self.backend.delete_route(&name).await;
        report.record(name, result);

        report
    }

    /// Project ids of every sandbox carrying the management label
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        let managed = self
            .backend
            .list_sandboxes(&self.settings.label("managed"), "true")
            .await?;
        let project_label = self.settings.label("project-id");
        Ok(managed
            .into_iter()
            .filter_map(|info| info.labels.get(&project_label).cloned())
            .collect())
    }

    pub async fn cleanup_all(&self) -> Result<Vec<(String, CleanupReport)>> {
        let projects = self.list_projects().await?;
        info!("Cleaning up {} managed sandbox(es)", projects.len());

        let mut reports = Vec::with_capacity(projects.len());
        for project_id in projects {
            let report = self.cleanup_project(&project_id).await;
            reports.push((project_id, report));
        }
        Ok(reports)
    }

    pub async fn check_connection(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} backend not available: {}", self.backend.name(), e);
                false
            }
        }
    }
}

fn absent_is_ok(result: std::result::Result<(), BackendError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
