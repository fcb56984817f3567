// ABOUTME: In-process simulated cluster backend
// ABOUTME: Keeps sandboxes, files and process tables in memory and records every call for inspection

use super::{
    ClusterBackend, EndpointInfo, EndpointSpec, ExecOutput, Result, RouteInfo, RouteSpec,
    SandboxInfo, SandboxPhase, SandboxSpec, StartupConfigInfo, StartupConfigSpec,
};
use crate::error::BackendError;
use crate::restart::{BROADCAST_SCRIPT, PROCESS_LISTING_SCRIPT, RECOVERY_SCRIPT};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// One request made against the simulated backend
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub op: &'static str,
    pub target: String,
}

impl BackendCall {
    /// Requests that change cluster resources
    pub fn is_mutation(&self) -> bool {
        self.op.starts_with("create_") || self.op.starts_with("delete_") || self.op == "attach_endpoint"
    }
}

#[derive(Debug, Clone)]
struct SimProcess {
    pid: u32,
    cmdline: String,
}

#[derive(Debug)]
struct SimSandbox {
    info: SandboxInfo,
    files: BTreeMap<String, Vec<u8>>,
    processes: Vec<SimProcess>,
    signals: Vec<(u32, String)>,
    writes: Vec<String>,
    logs: Vec<String>,
}

#[derive(Debug)]
struct Cluster {
    sandboxes: HashMap<String, SimSandbox>,
    endpoints: HashMap<String, EndpointInfo>,
    routes: HashMap<String, RouteInfo>,
    configs: HashMap<String, StartupConfigSpec>,
    calls: Vec<BackendCall>,
    initial_phase: SandboxPhase,
    initial_ready: bool,
    race_next_create: bool,
    failing_exec: Vec<String>,
    failing_uploads: Vec<String>,
    failing_lookups: bool,
    reachable: bool,
    next_pid: u32,
}

pub struct MemoryBackend {
    cluster: Mutex<Cluster>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            cluster: Mutex::new(Cluster {
                sandboxes: HashMap::new(),
                endpoints: HashMap::new(),
                routes: HashMap::new(),
                configs: HashMap::new(),
                calls: Vec::new(),
                initial_phase: SandboxPhase::Running,
                initial_ready: true,
                race_next_create: false,
                failing_exec: Vec::new(),
                failing_uploads: Vec::new(),
                failing_lookups: false,
                reachable: true,
                next_pid: 100,
            }),
        }
    }

    fn cluster(&self) -> MutexGuard<'_, Cluster> {
        self.cluster.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<BackendCall> {
        self.cluster().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.cluster().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.cluster().calls.clear();
    }

    /// Phase and readiness given to sandboxes created from now on
    pub fn set_initial_phase(&self, phase: SandboxPhase, ready: bool) {
        let mut cluster = self.cluster();
        cluster.initial_phase = phase;
        cluster.initial_ready = ready;
    }

    pub fn set_phase(&self, sandbox: &str, phase: SandboxPhase, ready: bool) {
        if let Some(sim) = self.cluster().sandboxes.get_mut(sandbox) {
            sim.info.phase = phase;
            sim.info.ready = ready;
        }
    }

    pub fn set_waiting_reason(&self, sandbox: &str, reason: Option<&str>) {
        if let Some(sim) = self.cluster().sandboxes.get_mut(sandbox) {
            sim.info.waiting_reason = reason.map(str::to_string);
        }
    }

    /// The next create_sandbox stores the sandbox but reports Conflict, as if a concurrent caller won
    pub fn race_next_create(&self) {
        self.cluster().race_next_create = true;
    }

    /// Exec requests whose command line contains `needle` exit with status 1
    pub fn fail_exec_containing(&self, needle: &str) {
        self.cluster().failing_exec.push(needle.to_string());
    }

    /// Uploads that would write `path` fail
    pub fn fail_upload_of(&self, path: &str) {
        self.cluster().failing_uploads.push(path.to_string());
    }

    /// While set, get_sandbox fails with a non-NotFound error
    pub fn fail_sandbox_lookups(&self, failing: bool) {
        self.cluster().failing_lookups = failing;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.cluster().reachable = reachable;
    }

    pub fn sandbox_exists(&self, sandbox: &str) -> bool {
        self.cluster().sandboxes.contains_key(sandbox)
    }

    pub fn endpoint_exists(&self, name: &str) -> bool {
        self.cluster().endpoints.contains_key(name)
    }

    pub fn route_exists(&self, name: &str) -> bool {
        self.cluster().routes.contains_key(name)
    }

    pub fn startup_config(&self, name: &str) -> Option<StartupConfigSpec> {
        self.cluster().configs.get(name).cloned()
    }

    pub fn put_file(&self, sandbox: &str, path: &str, content: &[u8]) {
        if let Some(sim) = self.cluster().sandboxes.get_mut(sandbox) {
            sim.files.insert(path.to_string(), content.to_vec());
        }
    }

    pub fn file(&self, sandbox: &str, path: &str) -> Option<Vec<u8>> {
        self.cluster()
            .sandboxes
            .get(sandbox)
            .and_then(|sim| sim.files.get(path).cloned())
    }

    /// Paths written through archive uploads, in order
    pub fn written_paths(&self, sandbox: &str) -> Vec<String> {
        self.cluster()
            .sandboxes
            .get(sandbox)
            .map(|sim| sim.writes.clone())
            .unwrap_or_default()
    }

    pub fn set_processes(&self, sandbox: &str, processes: &[(u32, &str)]) {
        if let Some(sim) = self.cluster().sandboxes.get_mut(sandbox) {
            sim.processes = processes
                .iter()
                .map(|(pid, cmdline)| SimProcess {
                    pid: *pid,
                    cmdline: cmdline.to_string(),
                })
                .collect();
        }
    }

    /// Signals delivered as `(pid, signal)`
    pub fn signals(&self, sandbox: &str) -> Vec<(u32, String)> {
        self.cluster()
            .sandboxes
            .get(sandbox)
            .map(|sim| sim.signals.clone())
            .unwrap_or_default()
    }

    pub fn push_log(&self, sandbox: &str, line: &str) {
        if let Some(sim) = self.cluster().sandboxes.get_mut(sandbox) {
            sim.logs.push(line.to_string());
        }
    }

    fn record(cluster: &mut Cluster, op: &'static str, target: &str) {
        cluster.calls.push(BackendCall {
            op,
            target: target.to_string(),
        });
    }
}

fn not_found(kind: &str, name: &str) -> BackendError {
    BackendError::NotFound(format!("{} {} not found", kind, name))
}

fn exit(code: i64, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

/// Interpret the command vocabulary used by the executor and restart controller
fn interpret(sim: &mut SimSandbox, next_pid: &mut u32, command: &[String]) -> ExecOutput {
    let args: Vec<&str> = command.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["sha256sum", path] => match sim.files.get(*path) {
            Some(content) => exit(
                0,
                format!("{}  {}\n", hex::encode(Sha256::digest(content)), path),
                "",
            ),
            None => exit(
                1,
                "",
                format!("sha256sum: {}: No such file or directory\n", path),
            ),
        },
        ["mkdir", "-p", ..] => exit(0, "", ""),
        ["cat", path] => match sim.files.get(*path) {
            Some(content) => exit(0, content.clone(), ""),
            None => exit(1, "", format!("cat: can't open '{}'\n", path)),
        },
        ["kill", signal, pid] => {
            let signal = signal.trim_start_matches('-').to_string();
            let Ok(pid) = pid.parse::<u32>() else {
                return exit(1, "", format!("kill: bad pid '{}'\n", pid));
            };
            let Some(index) = sim.processes.iter().position(|p| p.pid == pid) else {
                return exit(1, "", format!("kill: ({}) - No such process\n", pid));
            };
            sim.signals.push((pid, signal.clone()));
            if signal != "HUP" {
                // The supervisor loop relaunches the command under a new pid
                let cmdline = sim.processes.remove(index).cmdline;
                *next_pid += 1;
                sim.processes.push(SimProcess {
                    pid: *next_pid,
                    cmdline,
                });
            }
            exit(0, "", "")
        }
        ["sh", "-c", script] if *script == PROCESS_LISTING_SCRIPT => {
            let listing: String = sim
                .processes
                .iter()
                .map(|p| format!("{}\t{}\n", p.pid, p.cmdline))
                .collect();
            exit(0, listing, "")
        }
        ["sh", "-c", script] if *script == BROADCAST_SCRIPT => {
            let mut signalled = String::new();
            for process in &sim.processes {
                if process.pid != 1 && !process.cmdline.starts_with("sh ") {
                    sim.signals.push((process.pid, "HUP".to_string()));
                    signalled.push_str(&format!("{}\n", process.pid));
                }
            }
            exit(0, signalled, "")
        }
        ["sh", "-c", script] if *script == RECOVERY_SCRIPT => {
            sim.logs.push("[recovery] relaunching start command".to_string());
            exit(0, "relaunched\n", "")
        }
        _ => exit(
            127,
            "",
            format!("sh: {}: not found\n", args.first().copied().unwrap_or_default()),
        ),
    }
}

fn join_path(dir: &str, entry: &str) -> String {
    let entry = entry.trim_start_matches("./");
    if dir.ends_with('/') {
        format!("{}{}", dir, entry)
    } else {
        format!("{}/{}", dir, entry)
    }
}

#[async_trait]
impl ClusterBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        if self.cluster().reachable {
            Ok(())
        } else {
            Err(BackendError::Unavailable("simulated outage".to_string()))
        }
    }

    async fn get_sandbox(&self, name: &str) -> Result<SandboxInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "get_sandbox", name);
        if cluster.failing_lookups {
            return Err(BackendError::Other(format!("simulated lookup failure for {}", name)));
        }
        cluster
            .sandboxes
            .get(name)
            .map(|sim| sim.info.clone())
            .ok_or_else(|| not_found("sandbox", name))
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "create_sandbox", &spec.name);

        let raced = std::mem::take(&mut cluster.race_next_create);
        if cluster.sandboxes.contains_key(&spec.name) {
            return Err(BackendError::Conflict(format!("sandbox {} exists", spec.name)));
        }

        cluster.next_pid += 1;
        let info = SandboxInfo {
            name: spec.name.clone(),
            phase: cluster.initial_phase,
            ready: cluster.initial_ready,
            labels: spec.labels.clone(),
            waiting_reason: None,
            created_at: Some(chrono::Utc::now()),
        };
        cluster.sandboxes.insert(
            spec.name.clone(),
            SimSandbox {
                info: info.clone(),
                files: BTreeMap::new(),
                processes: vec![SimProcess {
                    pid: 1,
                    cmdline: spec.command.join(" "),
                }],
                signals: Vec::new(),
                writes: Vec::new(),
                logs: vec![format!("[bootstrap] sandbox {} created", spec.name)],
            },
        );
        debug!("Simulated sandbox {} created", spec.name);

        if raced {
            return Err(BackendError::Conflict(format!("sandbox {} exists", spec.name)));
        }
        Ok(info)
    }

    async fn delete_sandbox(&self, name: &str) -> Result<()> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "delete_sandbox", name);
        cluster
            .sandboxes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("sandbox", name))
    }

    async fn list_sandboxes(&self, label: &str, value: &str) -> Result<Vec<SandboxInfo>> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "list_sandboxes", &format!("{}={}", label, value));
        let mut found: Vec<SandboxInfo> = cluster
            .sandboxes
            .values()
            .filter(|sim| sim.info.labels.get(label).map(String::as_str) == Some(value))
            .map(|sim| sim.info.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn get_endpoint(&self, name: &str) -> Result<EndpointInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "get_endpoint", name);
        cluster
            .endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("endpoint", name))
    }

    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<EndpointInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "create_endpoint", &spec.name);
        if cluster.endpoints.contains_key(&spec.name) {
            return Err(BackendError::Conflict(format!("endpoint {} exists", spec.name)));
        }
        let info = EndpointInfo {
            name: spec.name.clone(),
            attached: Vec::new(),
        };
        cluster.endpoints.insert(spec.name.clone(), info.clone());
        Ok(info)
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "delete_endpoint", name);
        cluster
            .endpoints
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("endpoint", name))
    }

    async fn attach_endpoint(&self, endpoint: &str, sandbox: &str) -> Result<()> {
        let mut cluster = self.cluster();
        let already = cluster
            .endpoints
            .get(endpoint)
            .ok_or_else(|| not_found("endpoint", endpoint))?
            .attached
            .iter()
            .any(|s| s == sandbox);
        if already {
            return Ok(());
        }
        Self::record(&mut cluster, "attach_endpoint", &format!("{}<-{}", endpoint, sandbox));
        if let Some(info) = cluster.endpoints.get_mut(endpoint) {
            info.attached.push(sandbox.to_string());
        }
        Ok(())
    }

    async fn get_route(&self, name: &str) -> Result<RouteInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "get_route", name);
        cluster
            .routes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("route", name))
    }

    async fn create_route(&self, spec: &RouteSpec) -> Result<RouteInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "create_route", &spec.name);
        if cluster.routes.contains_key(&spec.name) {
            return Err(BackendError::Conflict(format!("route {} exists", spec.name)));
        }
        let info = RouteInfo {
            name: spec.name.clone(),
            host: spec.host.clone(),
        };
        cluster.routes.insert(spec.name.clone(), info.clone());
        Ok(info)
    }

    async fn delete_route(&self, name: &str) -> Result<()> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "delete_route", name);
        cluster
            .routes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("route", name))
    }

    async fn get_startup_config(&self, name: &str) -> Result<StartupConfigInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "get_startup_config", name);
        cluster
            .configs
            .get(name)
            .map(|spec| StartupConfigInfo::from_files(&spec.name, &spec.files))
            .ok_or_else(|| not_found("startup config", name))
    }

    async fn create_startup_config(&self, spec: &StartupConfigSpec) -> Result<StartupConfigInfo> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "create_startup_config", &spec.name);
        if cluster.configs.contains_key(&spec.name) {
            return Err(BackendError::Conflict(format!(
                "startup config {} exists",
                spec.name
            )));
        }
        cluster.configs.insert(spec.name.clone(), spec.clone());
        Ok(StartupConfigInfo::from_files(&spec.name, &spec.files))
    }

    async fn delete_startup_config(&self, name: &str) -> Result<()> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "delete_startup_config", name);
        cluster
            .configs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("startup config", name))
    }

    async fn exec(&self, sandbox: &str, command: &[String]) -> Result<ExecOutput> {
        let mut guard = self.cluster();
        let cluster = &mut *guard;
        let line = command.join(" ");
        Self::record(cluster, "exec", &line);

        let sim = cluster
            .sandboxes
            .get_mut(sandbox)
            .ok_or_else(|| not_found("sandbox", sandbox))?;
        if sim.info.phase != SandboxPhase::Running {
            return Err(BackendError::Conflict(format!(
                "sandbox {} is not running",
                sandbox
            )));
        }
        if cluster.failing_exec.iter().any(|needle| line.contains(needle)) {
            return Ok(exit(1, "", "simulated failure\n"));
        }
        Ok(interpret(sim, &mut cluster.next_pid, command))
    }

    async fn upload_archive(&self, sandbox: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()> {
        let mut guard = self.cluster();
        let cluster = &mut *guard;
        Self::record(cluster, "upload_archive", dest_dir);

        let sim = cluster
            .sandboxes
            .get_mut(sandbox)
            .ok_or_else(|| not_found("sandbox", sandbox))?;

        let mut unpacked = Vec::new();
        let mut reader = tar::Archive::new(archive.as_slice());
        let entries = reader
            .entries()
            .map_err(|e| BackendError::Other(format!("bad archive: {}", e)))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| BackendError::Other(format!("bad archive: {}", e)))?;
            let entry_path = entry
                .path()
                .map_err(|e| BackendError::Other(format!("bad archive: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let path = join_path(dest_dir, &entry_path);
            if cluster.failing_uploads.iter().any(|p| *p == path) {
                return Err(BackendError::Other(format!("simulated write failure for {}", path)));
            }
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| BackendError::Other(format!("bad archive: {}", e)))?;
            unpacked.push((path, content));
        }

        for (path, content) in unpacked {
            sim.writes.push(path.clone());
            sim.files.insert(path, content);
        }
        Ok(())
    }

    async fn logs(&self, sandbox: &str, tail: usize) -> Result<String> {
        let mut cluster = self.cluster();
        Self::record(&mut cluster, "logs", sandbox);
        let sim = cluster
            .sandboxes
            .get(sandbox)
            .ok_or_else(|| not_found("sandbox", sandbox))?;
        let skip = sim.logs.len().saturating_sub(tail);
        Ok(sim.logs[skip..].join("\n"))
    }
}
