// ABOUTME: Docker implementation of the cluster backend using bollard
// ABOUTME: Sandboxes are containers, endpoints are per-project networks, routes are Traefik file-provider documents

use super::{
    ClusterBackend, EndpointInfo, EndpointSpec, ExecOutput, Result, RouteInfo, RouteSpec,
    SandboxInfo, SandboxPhase, SandboxSpec, StartupConfigInfo, StartupConfigSpec,
};
use crate::error::BackendError;
use crate::settings::SandboxSettings;
use crate::startup::{script_runtime, STARTUP_SCRIPT_FILE};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{EndpointSettings, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
    network::{
        ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
        InspectNetworkOptions,
    },
    Docker,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Map a bollard failure onto the backend taxonomy.
pub fn translate_error(err: bollard::errors::Error) -> BackendError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => BackendError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => BackendError::Conflict(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => BackendError::Other(format!("docker returned {}: {}", status_code, message)),
        other => BackendError::Other(other.to_string()),
    }
}

fn io_error(path: &Path, err: std::io::Error) -> BackendError {
    match err.kind() {
        ErrorKind::NotFound => BackendError::NotFound(path.display().to_string()),
        ErrorKind::AlreadyExists => BackendError::Conflict(path.display().to_string()),
        _ => BackendError::Other(format!("{}: {}", path.display(), err)),
    }
}

pub struct DockerBackend {
    client: Docker,
    config_root: PathBuf,
    routes_dir: PathBuf,
    route_entrypoint: String,
    /// Images already confirmed present, to skip repeated inspects
    image_cache: Arc<RwLock<HashSet<String>>>,
    pull_timeout: Duration,
}

impl DockerBackend {
    pub fn new(settings: &SandboxSettings) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Docker, settings: &SandboxSettings) -> Self {
        Self {
            client,
            config_root: settings.config_root.clone(),
            routes_dir: settings.routes_dir.clone(),
            route_entrypoint: settings.route_entrypoint.clone(),
            image_cache: Arc::new(RwLock::new(HashSet::new())),
            pull_timeout: Duration::from_secs(600),
        }
    }

    fn config_dir(&self, name: &str) -> PathBuf {
        self.config_root.join(name)
    }

    fn route_file(&self, name: &str) -> PathBuf {
        self.routes_dir.join(format!("{}.toml", name))
    }

    /// Convert a sandbox spec to a bollard container config
    fn to_container_config(&self, spec: &SandboxSpec) -> Config<String> {
        let container_port = format!("{}/tcp", spec.app_port);
        let exposed_ports = HashMap::from([(container_port.clone(), HashMap::new())]);

        let port_bindings = spec.host_port.map(|host_port| {
            HashMap::from([(
                container_port.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            )])
        });

        let binds = vec![format!(
            "{}:{}:ro",
            self.config_dir(&spec.startup_config).display(),
            spec.config_mount
        )];

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings,
            memory: Some((spec.memory_limit_mb * 1024 * 1024) as i64),
            memory_reservation: Some((spec.memory_request_mb * 1024 * 1024) as i64),
            nano_cpus: Some((spec.cpu_limit_millis * 1_000_000) as i64),
            cpu_shares: Some((spec.cpu_request_millis * 1024 / 1000).max(2) as i64),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            working_dir: Some(spec.workdir.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            // Anonymous volume: empty on creation, removed with the container
            volumes: Some(HashMap::from([(spec.workdir.clone(), HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn convert_phase(status: &str, exit_code: Option<i64>) -> SandboxPhase {
        match status.to_lowercase().as_str() {
            "created" | "restarting" | "paused" => SandboxPhase::Pending,
            "running" => SandboxPhase::Running,
            "exited" if exit_code == Some(0) => SandboxPhase::Succeeded,
            "exited" | "dead" => SandboxPhase::Failed,
            _ => SandboxPhase::Unknown,
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains(image) {
            return Ok(());
        }

        match self.client.inspect_image(image).await {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.pull_image(image).await?,
            Err(e) => return Err(translate_error(e)),
        }

        self.image_cache.write().await.insert(image.to_string());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            while let Some(result) = stream.next().await {
                let info = result.map_err(translate_error)?;
                if let Some(status) = &info.status {
                    debug!("Pull status: {}", status);
                }
                if let Some(error) = info.error {
                    return Err(BackendError::Other(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Other(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RouteDocument {
    http: RouteHttp,
}

#[derive(Debug, Serialize, Deserialize)]
struct RouteHttp {
    routers: BTreeMap<String, Router>,
    services: BTreeMap<String, Service>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Router {
    rule: String,
    service: String,
    entry_points: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Service {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Server {
    url: String,
}

impl RouteDocument {
    fn for_spec(spec: &RouteSpec, entrypoint: &str) -> Self {
        let router = Router {
            rule: format!("Host(`{}`)", spec.host),
            service: spec.name.clone(),
            entry_points: vec![entrypoint.to_string()],
        };
        let service = Service {
            load_balancer: LoadBalancer {
                servers: vec![Server {
                    url: format!("http://{}:{}", spec.endpoint, spec.port),
                }],
            },
        };
        Self {
            http: RouteHttp {
                routers: BTreeMap::from([(spec.name.clone(), router)]),
                services: BTreeMap::from([(spec.name.clone(), service)]),
            },
        }
    }

    fn host(&self) -> Option<String> {
        self.http.routers.values().next().map(|router| {
            router
                .rule
                .trim_start_matches("Host(`")
                .trim_end_matches("`)")
                .to_string()
        })
    }
}

#[async_trait]
impl ClusterBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }

    async fn get_sandbox(&self, name: &str) -> Result<SandboxInfo> {
        let inspect = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(translate_error)?;

        let state = inspect.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.as_ref().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let exit_code = state.and_then(|s| s.exit_code);
        let phase = Self::convert_phase(&status, exit_code);

        let waiting_reason = match state {
            Some(s) if s.restarting == Some(true) => Some(format!(
                "restarting after exit code {}",
                s.exit_code.unwrap_or_default()
            )),
            Some(s) if s.oom_killed == Some(true) => Some("OOMKilled".to_string()),
            Some(s) => s.error.clone().filter(|e| !e.is_empty()),
            None => None,
        };

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(SandboxInfo {
            name: name.to_string(),
            phase,
            ready: phase == SandboxPhase::Running,
            labels: inspect
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
            waiting_reason,
            created_at,
        })
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxInfo> {
        info!("Creating container: {}", spec.name);

        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.to_container_config(spec))
            .await
            .map_err(translate_error)?;

        debug!("Created container {} ({})", spec.name, container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(translate_error)?;

        self.get_sandbox(&spec.name).await
    }

    async fn delete_sandbox(&self, name: &str) -> Result<()> {
        info!("Removing container: {}", name);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(name, Some(options))
            .await
            .map_err(translate_error)
    }

    async fn list_sandboxes(&self, label: &str, value: &str) -> Result<Vec<SandboxInfo>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", label, value)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(translate_error)?;

        let mut sandboxes = Vec::new();
        for container in containers {
            let Some(name) = container
                .names
                .and_then(|names| names.into_iter().next())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };
            match self.get_sandbox(&name).await {
                Ok(info) => sandboxes.push(info),
                Err(e) => warn!("Failed to inspect container {}: {}", name, e),
            }
        }
        Ok(sandboxes)
    }

    async fn get_endpoint(&self, name: &str) -> Result<EndpointInfo> {
        let network = self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(translate_error)?;

        let attached = network
            .containers
            .unwrap_or_default()
            .into_values()
            .filter_map(|c| c.name)
            .collect();

        Ok(EndpointInfo {
            name: name.to_string(),
            attached,
        })
    }

    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<EndpointInfo> {
        info!("Creating network: {}", spec.name);

        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: "bridge".to_string(),
            labels: spec.labels.clone(),
            ..Default::default()
        };
        self.client
            .create_network(options)
            .await
            .map_err(translate_error)?;

        Ok(EndpointInfo {
            name: spec.name.clone(),
            attached: Vec::new(),
        })
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        info!("Removing network: {}", name);

        // Docker refuses to remove networks with attached containers
        let endpoint = self.get_endpoint(name).await?;
        for container in endpoint.attached {
            let options = DisconnectNetworkOptions {
                container: container.clone(),
                force: true,
            };
            if let Err(e) = self.client.disconnect_network(name, options).await {
                warn!("Failed to disconnect {} from {}: {}", container, name, e);
            }
        }

        self.client
            .remove_network(name)
            .await
            .map_err(translate_error)
    }

    async fn attach_endpoint(&self, endpoint: &str, sandbox: &str) -> Result<()> {
        let current = self.get_endpoint(endpoint).await?;
        if current.attached.iter().any(|c| c == sandbox) {
            return Ok(());
        }

        debug!("Connecting {} to network {}", sandbox, endpoint);
        let options = ConnectNetworkOptions {
            container: sandbox.to_string(),
            endpoint_config: EndpointSettings {
                aliases: Some(vec![endpoint.to_string()]),
                ..Default::default()
            },
        };
        self.client
            .connect_network(endpoint, options)
            .await
            .map_err(translate_error)
    }

    async fn get_route(&self, name: &str) -> Result<RouteInfo> {
        let path = self.route_file(name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let document: RouteDocument = toml::from_str(&text)
            .map_err(|e| BackendError::Other(format!("{}: {}", path.display(), e)))?;

        Ok(RouteInfo {
            name: name.to_string(),
            host: document.host().unwrap_or_default(),
        })
    }

    async fn create_route(&self, spec: &RouteSpec) -> Result<RouteInfo> {
        info!("Writing route {} for host {}", spec.name, spec.host);

        tokio::fs::create_dir_all(&self.routes_dir)
            .await
            .map_err(|e| io_error(&self.routes_dir, e))?;

        let document = RouteDocument::for_spec(spec, &self.route_entrypoint);
        let text = toml::to_string(&document)
            .map_err(|e| BackendError::Other(format!("route {}: {}", spec.name, e)))?;

        let path = self.route_file(&spec.name);
        write_new_file(&path, text.as_bytes()).await?;

        Ok(RouteInfo {
            name: spec.name.clone(),
            host: spec.host.clone(),
        })
    }

    async fn delete_route(&self, name: &str) -> Result<()> {
        let path = self.route_file(name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn get_startup_config(&self, name: &str) -> Result<StartupConfigInfo> {
        let dir = self.config_dir(name);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
        files.sort();

        let script = dir.join(STARTUP_SCRIPT_FILE);
        let runtime = match tokio::fs::read_to_string(&script).await {
            Ok(content) => script_runtime(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(io_error(&script, e)),
        };

        Ok(StartupConfigInfo {
            name: name.to_string(),
            files,
            runtime,
        })
    }

    /// Files are staged in a hidden sibling directory and renamed into place,
    /// so a failed write never leaves a partial bundle under the final name.
    async fn create_startup_config(&self, spec: &StartupConfigSpec) -> Result<StartupConfigInfo> {
        info!("Writing startup config: {}", spec.name);

        tokio::fs::create_dir_all(&self.config_root)
            .await
            .map_err(|e| io_error(&self.config_root, e))?;

        let dir = self.config_dir(&spec.name);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(BackendError::Conflict(dir.display().to_string()));
        }

        let staging = self
            .config_root
            .join(format!(".{}.{}", spec.name, Uuid::new_v4().simple()));
        tokio::fs::create_dir(&staging)
            .await
            .map_err(|e| io_error(&staging, e))?;

        let staged = async {
            for (file, content) in &spec.files {
                write_new_file(&staging.join(file), content.as_bytes()).await?;
            }
            tokio::fs::rename(&staging, &dir).await.map_err(|e| {
                if dir.exists() {
                    BackendError::Conflict(dir.display().to_string())
                } else {
                    io_error(&dir, e)
                }
            })
        };
        if let Err(e) = staged.await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                warn!("Failed to remove staging dir {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        Ok(StartupConfigInfo::from_files(&spec.name, &spec.files))
    }

    async fn delete_startup_config(&self, name: &str) -> Result<()> {
        let dir = self.config_dir(name);
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))
    }

    async fn exec(&self, sandbox: &str, command: &[String]) -> Result<ExecOutput> {
        debug!("Executing in {}: {:?}", sandbox, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(sandbox, exec_config)
            .await
            .map_err(translate_error)?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(translate_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg.map_err(translate_error)? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::Console { message } => stdout.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(BackendError::Other(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(translate_error)?;

        Ok(ExecOutput {
            exit_code: exec_inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }

    async fn upload_archive(&self, sandbox: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(sandbox, Some(options), archive.into())
            .await
            .map_err(translate_error)
    }

    async fn logs(&self, sandbox: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(sandbox, Some(options));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(translate_error)? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    text.push_str(&String::from_utf8_lossy(&message))
                }
                _ => {}
            }
        }
        Ok(text)
    }
}

/// Create `path`, failing with Conflict if it already exists.
async fn write_new_file(path: &Path, content: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    file.write_all(content)
        .await
        .map_err(|e| io_error(path, e))?;
    file.flush().await.map_err(|e| io_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::Runtime;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> DockerBackend {
        let settings = SandboxSettings {
            config_root: dir.path().join("configs"),
            routes_dir: dir.path().join("routes"),
            ..SandboxSettings::default()
        };
        DockerBackend::with_client(Docker::connect_with_local_defaults().unwrap(), &settings)
    }

    fn spec(host_port: Option<u16>) -> SandboxSpec {
        SandboxSpec {
            name: "code-editor-p1".to_string(),
            project_id: "p1".to_string(),
            runtime: Runtime::Node,
            image: "node:18-alpine".to_string(),
            command: vec!["sh".to_string(), "/scripts/startup.sh".to_string()],
            env: BTreeMap::from([("PROJECT_ID".to_string(), "p1".to_string())]),
            labels: HashMap::from([("app".to_string(), "code-editor".to_string())]),
            workdir: "/workspace".to_string(),
            startup_config: "startup-script-p1".to_string(),
            config_mount: "/scripts".to_string(),
            app_port: 3000,
            host_port,
            memory_request_mb: 256,
            memory_limit_mb: 512,
            cpu_request_millis: 200,
            cpu_limit_millis: 500,
        }
    }

    #[test]
    fn test_translate_error_classifies_status_codes() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert!(translate_error(not_found).is_not_found());

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        assert!(translate_error(conflict).is_conflict());

        let other = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(matches!(translate_error(other), BackendError::Other(_)));
    }

    #[test]
    fn test_convert_phase() {
        assert_eq!(DockerBackend::convert_phase("running", None), SandboxPhase::Running);
        assert_eq!(DockerBackend::convert_phase("created", None), SandboxPhase::Pending);
        assert_eq!(DockerBackend::convert_phase("exited", Some(0)), SandboxPhase::Succeeded);
        assert_eq!(DockerBackend::convert_phase("exited", Some(1)), SandboxPhase::Failed);
        assert_eq!(DockerBackend::convert_phase("dead", None), SandboxPhase::Failed);
        assert_eq!(DockerBackend::convert_phase("", None), SandboxPhase::Unknown);
    }

    #[tokio::test]
    async fn test_container_config_conversion() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let config = backend.to_container_config(&spec(Some(30097)));
        assert_eq!(config.image.as_deref(), Some("node:18-alpine"));
        assert_eq!(config.working_dir.as_deref(), Some("/workspace"));
        assert!(config.volumes.unwrap().contains_key("/workspace"));

        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        let binds = host.binds.unwrap();
        assert!(binds[0].ends_with("startup-script-p1:/scripts:ro"));
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["3000/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("30097"));
    }

    #[tokio::test]
    async fn test_no_port_binding_without_host_port() {
        let dir = TempDir::new().unwrap();
        let config = backend(&dir).to_container_config(&spec(None));
        assert!(config.host_config.unwrap().port_bindings.is_none());
    }

    #[tokio::test]
    async fn test_startup_config_files_are_create_once() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let config = StartupConfigSpec {
            name: "startup-script-p1".to_string(),
            project_id: "p1".to_string(),
            files: BTreeMap::from([("startup.sh".to_string(), "#!/bin/sh\n".to_string())]),
        };

        backend.create_startup_config(&config).await.unwrap();
        let info = backend.get_startup_config("startup-script-p1").await.unwrap();
        assert_eq!(info.files, vec!["startup.sh".to_string()]);

        let again = backend.create_startup_config(&config).await;
        assert!(again.unwrap_err().is_conflict());

        backend.delete_startup_config("startup-script-p1").await.unwrap();
        let gone = backend.get_startup_config("startup-script-p1").await;
        assert!(gone.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_startup_config_write_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let config = StartupConfigSpec {
            name: "startup-script-p1".to_string(),
            project_id: "p1".to_string(),
            files: BTreeMap::from([
                ("nested/extra.sh".to_string(), "echo\n".to_string()),
                ("startup.sh".to_string(), "#!/bin/sh\n".to_string()),
            ]),
        };

        assert!(backend.create_startup_config(&config).await.is_err());
        let lookup = backend.get_startup_config("startup-script-p1").await;
        assert!(lookup.unwrap_err().is_not_found());

        let leftovers = std::fs::read_dir(dir.path().join("configs")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_startup_config_reports_script_runtime() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let script = crate::startup::generate_startup_script(Runtime::Ruby, &SandboxSettings::default());
        let config = StartupConfigSpec {
            name: "startup-script-p1".to_string(),
            project_id: "p1".to_string(),
            files: BTreeMap::from([("startup.sh".to_string(), script)]),
        };

        backend.create_startup_config(&config).await.unwrap();
        let info = backend.get_startup_config("startup-script-p1").await.unwrap();
        assert_eq!(info.runtime, Some(Runtime::Ruby));
        assert!(info.boots(Runtime::Ruby));
    }

    #[tokio::test]
    async fn test_route_document_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let route = RouteSpec {
            name: "code-editor-ingress-p1".to_string(),
            project_id: "p1".to_string(),
            host: "p1.apps.example.com".to_string(),
            endpoint: "code-editor-service-p1".to_string(),
            port: 3000,
        };

        backend.create_route(&route).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("routes/code-editor-ingress-p1.toml"))
            .unwrap();
        assert!(text.contains("Host(`p1.apps.example.com`)"));
        assert!(text.contains("http://code-editor-service-p1:3000"));
        assert!(text.contains("entryPoints"));

        let info = backend.get_route("code-editor-ingress-p1").await.unwrap();
        assert_eq!(info.host, "p1.apps.example.com");

        assert!(backend.create_route(&route).await.unwrap_err().is_conflict());
        backend.delete_route("code-editor-ingress-p1").await.unwrap();
        assert!(backend
            .delete_route("code-editor-ingress-p1")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
