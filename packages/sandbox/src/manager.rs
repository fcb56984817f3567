// ABOUTME: Sandbox lifecycle manager exposing the boundary operations per project
// ABOUTME: Orchestrates resources, file sync, app restarts and status broadcasts for start/stop/restart/sync

use crate::backend::ClusterBackend;
use crate::error::{Result, SandboxError};
use crate::executor::RemoteExecutor;
use crate::files::FileStore;
use crate::resources::{CleanupReport, ResourceController, SandboxObservation};
use crate::restart::{AppRestartController, RestartOutcome};
use crate::settings::SandboxSettings;
use crate::startup::Runtime;
use crate::status::{
    Clock, ContainerStatus, FileUpdatedEvent, PreviewUpdatedEvent, ProjectStatus, StatusEvent,
    StatusRegistry, StatusSweeper, Subscription, SystemClock,
};
use crate::sync::{FileSynchronizer, SyncReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_PROJECT_ID_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub status: ContainerStatus,
    pub endpoint_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: ContainerStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

/// Project ids become resource names and hostnames
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let valid = !project_id.is_empty()
        && project_id.len() <= MAX_PROJECT_ID_LEN
        && project_id
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidProjectId(project_id.to_string()))
    }
}

struct ManagerInner {
    settings: Arc<SandboxSettings>,
    resources: Arc<ResourceController>,
    sync: FileSynchronizer,
    restart: AppRestartController,
    status: Arc<StatusRegistry>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Entry point for per-project sandbox operations.
///
/// Start, stop, restart and sync for one project are serialized in this process;
/// the background part of a start keeps the project locked until it settles.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

impl SandboxManager {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        files: Arc<dyn FileStore>,
        settings: SandboxSettings,
    ) -> Self {
        Self::with_clock(backend, files, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backend: Arc<dyn ClusterBackend>,
        files: Arc<dyn FileStore>,
        settings: SandboxSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = Arc::new(settings);
        let resources = Arc::new(ResourceController::new(backend.clone(), settings.clone()));
        let executor = RemoteExecutor::new(backend);
        let sync = FileSynchronizer::new(executor.clone(), files);
        let restart =
            AppRestartController::new(executor, resources.clone(), settings.restart_grace);

        Self {
            inner: Arc::new(ManagerInner {
                settings,
                resources,
                sync,
                restart,
                status: Arc::new(StatusRegistry::new(clock)),
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> Arc<StatusRegistry> {
        self.inner.status.clone()
    }

    pub fn resources(&self) -> &ResourceController {
        &self.inner.resources
    }

    /// Background purge of idle status records using the configured interval and expiry
    pub fn sweeper(&self) -> StatusSweeper {
        StatusSweeper::new(
            self.inner.status.clone(),
            self.inner.settings.sweep_interval,
            self.inner.settings.status_expiry,
        )
    }

    /// Idle entries, held by nothing but the map, are pruned on each acquisition.
    async fn lock_project(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Apply a status change; rejected edges are logged by the registry and skipped.
    fn transition(&self, project_id: &str, status: ContainerStatus, message: impl Into<String>) {
        if let Err(e) = self.inner.status.set_status(project_id, status, message) {
            debug!("Status update for project {} skipped: {}", project_id, e);
        }
    }

    fn fail(&self, project_id: &str, err: SandboxError) -> SandboxError {
        error!("Project {} failed: {}", project_id, err);
        self.transition(project_id, ContainerStatus::Error, err.to_string());
        err
    }

    pub fn endpoint_url(&self, project_id: &str) -> String {
        self.inner.resources.allocator().endpoint_url(project_id)
    }

    /// Provision the project's sandbox and begin pushing files in the background.
    ///
    /// Returns `running` at once when the sandbox is already up, otherwise `creating`.
    pub async fn start(&self, project_id: &str, runtime: Runtime) -> Result<StartResponse> {
        validate_project_id(project_id)?;
        let guard = self.lock_project(project_id).await;
        info!("Starting sandbox for project {} ({})", project_id, runtime);

        self.transition(project_id, ContainerStatus::Creating, "Creating sandbox");
        let endpoint_url = self.endpoint_url(project_id);

        let already_running = match self.provision(project_id, runtime).await {
            Ok(running) => running,
            Err(e) => return Err(self.fail(project_id, e)),
        };

        if already_running {
            self.transition(project_id, ContainerStatus::Running, "Sandbox is running");
            return Ok(StartResponse {
                status: ContainerStatus::Running,
                endpoint_url,
            });
        }

        self.spawn_settle(project_id, guard);
        Ok(StartResponse {
            status: ContainerStatus::Creating,
            endpoint_url,
        })
    }

    /// Ensure sandbox, endpoint and route. Returns whether the sandbox was already running.
    async fn provision(&self, project_id: &str, runtime: Runtime) -> Result<bool> {
        let resources = &self.inner.resources;
        let already_running = resources.get_sandbox_status(project_id).await?.is_running();
        if !already_running {
            resources.ensure_sandbox(project_id, runtime).await?;
        }
        resources.ensure_network_endpoint(project_id).await?;
        resources.ensure_public_route(project_id).await?;
        Ok(already_running)
    }

    /// Run the wait-sync-announce sequence detached, keeping the project locked.
    fn spawn_settle(&self, project_id: &str, guard: OwnedMutexGuard<()>) {
        let manager = self.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = manager.settle(&project_id).await {
                manager.fail(&project_id, e);
            }
        });
    }

    async fn settle(&self, project_id: &str) -> Result<()> {
        self.transition(
            project_id,
            ContainerStatus::Syncing,
            "Waiting for sandbox to become ready",
        );
        self.wait_for_ready(project_id).await?;

        self.transition(project_id, ContainerStatus::Syncing, "Pushing project files");
        let report = self.inner.sync.sync_all(project_id).await?;

        self.transition(
            project_id,
            ContainerStatus::Running,
            format!("Sandbox is running ({} file(s) synced)", report.changed_count),
        );
        self.inner.status.broadcast(
            project_id,
            StatusEvent::PreviewUpdated(PreviewUpdatedEvent {
                project_id: project_id.to_string(),
                url: self.endpoint_url(project_id),
                timestamp: self.inner.status.now(),
            }),
        );
        Ok(())
    }

    /// Poll until the backend reports the sandbox running and ready
    async fn wait_for_ready(&self, project_id: &str) -> Result<()> {
        let timeout = self.inner.settings.ready_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let observed = self.inner.resources.get_sandbox_status(project_id).await?;
            if observed.is_ready() {
                debug!("Sandbox for project {} is ready", project_id);
                return Ok(());
            }
            match &observed {
                SandboxObservation::Absent => {
                    return Err(SandboxError::NotFound(format!(
                        "sandbox for project {} disappeared while starting",
                        project_id
                    )))
                }
                SandboxObservation::Present { phase, .. } if phase.is_failed() => {
                    let (_, message) = observed.logical_status();
                    return Err(SandboxError::Unknown(message));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(SandboxError::Timeout(format!(
                    "sandbox for project {} not ready after {:?}",
                    project_id, timeout
                )));
            }
            tokio::time::sleep(self.inner.settings.ready_poll_interval).await;
        }
    }

    /// Delete the sandbox. Endpoint, route and startup config are kept for the next start.
    pub async fn stop(&self, project_id: &str) -> Result<ContainerStatus> {
        validate_project_id(project_id)?;
        let _guard = self.lock_project(project_id).await;
        info!("Stopping sandbox for project {}", project_id);

        if let Err(e) = self.inner.resources.delete_sandbox(project_id).await {
            return Err(self.fail(project_id, e));
        }
        self.transition(project_id, ContainerStatus::Stopped, "Sandbox stopped");
        Ok(ContainerStatus::Stopped)
    }

    /// Recreate the sandbox from scratch, keeping its runtime
    pub async fn restart(&self, project_id: &str) -> Result<ContainerStatus> {
        validate_project_id(project_id)?;
        let guard = self.lock_project(project_id).await;

        let runtime = match self.inner.resources.get_sandbox_status(project_id).await {
            Ok(observed) => observed.runtime().unwrap_or(Runtime::Node),
            Err(e) => return Err(self.fail(project_id, e)),
        };
        info!("Restarting sandbox for project {} ({})", project_id, runtime);
        self.transition(project_id, ContainerStatus::Creating, "Restarting sandbox");

        let recreate = async {
            self.inner.resources.delete_sandbox(project_id).await?;
            tokio::time::sleep(self.inner.settings.delete_grace).await;
            self.provision(project_id, runtime).await
        };
        if let Err(e) = recreate.await {
            return Err(self.fail(project_id, e));
        }

        self.spawn_settle(project_id, guard);
        Ok(ContainerStatus::Creating)
    }

    /// Push changed files into the running sandbox and restart the app if anything changed
    pub async fn sync(&self, project_id: &str) -> Result<SyncReport> {
        validate_project_id(project_id)?;
        let _guard = self.lock_project(project_id).await;

        let observed = match self.inner.resources.get_sandbox_status(project_id).await {
            Ok(observed) => observed,
            Err(e) => return Err(self.fail(project_id, e)),
        };
        if !observed.is_running() {
            return Err(SandboxError::NotRunning(project_id.to_string()));
        }

        // The record may have been swept or lost while the sandbox kept running
        let current = self.inner.status.get_status(project_id).status;
        if !matches!(current, ContainerStatus::Running | ContainerStatus::Syncing) {
            self.inner
                .status
                .observe(project_id, ContainerStatus::Running, "Sandbox is running");
        }

        self.transition(project_id, ContainerStatus::Syncing, "Syncing files");
        let report = match self.inner.sync.sync_smart(project_id).await {
            Ok(report) => report,
            Err(e) => return Err(self.fail(project_id, e)),
        };

        if report.has_changes {
            let outcome = self.inner.restart.restart_app(project_id).await;
            debug!("Restart after sync of project {}: {:?}", project_id, outcome);
            self.transition(
                project_id,
                ContainerStatus::Running,
                format!("{} file(s) updated", report.changed_count),
            );
        } else {
            self.transition(project_id, ContainerStatus::Running, "No file changes");
        }
        Ok(report)
    }

    /// Signal the in-sandbox app to restart without recreating the sandbox
    pub async fn restart_app(&self, project_id: &str) -> Result<RestartOutcome> {
        validate_project_id(project_id)?;
        Ok(self.inner.restart.restart_app(project_id).await)
    }

    /// Status derived from the backend; unreachable backends read as `error`
    pub async fn status(&self, project_id: &str) -> Result<StatusResponse> {
        validate_project_id(project_id)?;

        let (status, message) = match self.inner.resources.get_sandbox_status(project_id).await {
            Ok(observed) => observed.logical_status(),
            Err(e) => {
                warn!("Could not read sandbox of project {}: {}", project_id, e);
                (ContainerStatus::Error, e.to_string())
            }
        };

        let endpoint_url =
            (status == ContainerStatus::Running).then(|| self.endpoint_url(project_id));
        Ok(StatusResponse {
            status,
            message,
            endpoint_url,
        })
    }

    pub async fn logs(&self, project_id: &str, tail: usize) -> Result<String> {
        validate_project_id(project_id)?;
        self.inner.resources.sandbox_logs(project_id, tail).await
    }

    /// Remove every resource of the project
    pub async fn cleanup(&self, project_id: &str) -> Result<CleanupReport> {
        validate_project_id(project_id)?;
        let _guard = self.lock_project(project_id).await;

        let report = self.inner.resources.cleanup_project(project_id).await;
        self.transition(project_id, ContainerStatus::Stopped, "Sandbox removed");
        Ok(report)
    }

    /// Remove the resources of every managed sandbox
    pub async fn cleanup_all(&self) -> Result<Vec<(String, CleanupReport)>> {
        let reports = self.inner.resources.cleanup_all().await?;
        for (project_id, _) in &reports {
            self.transition(project_id, ContainerStatus::Stopped, "Sandbox removed");
        }
        Ok(reports)
    }

    /// Tell subscribers a file was edited. Returns how many received it.
    pub fn notify_file_updated(&self, project_id: &str, filename: &str, content: &str) -> usize {
        self.inner.status.touch(project_id);
        self.inner.status.broadcast(
            project_id,
            StatusEvent::FileUpdated(FileUpdatedEvent {
                project_id: project_id.to_string(),
                filename: filename.to_string(),
                content: content.to_string(),
                timestamp: self.inner.status.now(),
            }),
        )
    }

    pub fn subscribe(&self, project_id: &str) -> Subscription {
        self.inner.status.subscribe(project_id)
    }

    pub fn unsubscribe(&self, project_id: &str, subscriber_id: Uuid) -> bool {
        self.inner.status.unsubscribe(project_id, subscriber_id)
    }

    /// Last status recorded in this process, without asking the backend
    pub fn cached_status(&self, project_id: &str) -> Option<ProjectStatus> {
        self.inner.status.cached(project_id)
    }

    pub async fn check_connection(&self) -> bool {
        self.inner.resources.check_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::files::MemoryFileStore;

    #[test]
    fn test_project_id_validation() {
        assert!(validate_project_id("proj-1_a").is_ok());
        assert!(validate_project_id("").is_err());
        assert!(validate_project_id("-leading").is_err());
        assert!(validate_project_id("has space").is_err());
        assert!(validate_project_id("../etc").is_err());
        assert!(validate_project_id(&"x".repeat(49)).is_err());
    }

    #[tokio::test]
    async fn test_idle_project_locks_are_pruned() {
        let manager = SandboxManager::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryFileStore::new()),
            SandboxSettings::immediate(),
        );
        for project_id in ["a", "b", "c"] {
            manager.stop(project_id).await.unwrap();
        }
        assert_eq!(manager.inner.locks.lock().await.len(), 1);

        let held = manager.lock_project("d").await;
        manager.stop("e").await.unwrap();
        let locks = manager.inner.locks.lock().await;
        assert!(locks.contains_key("d"));
        assert!(!locks.contains_key("c"));
        drop(locks);
        drop(held);
    }
}
