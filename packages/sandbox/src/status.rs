// ABOUTME: Per-project status state machine and push-event fan-out to subscribers
// ABOUTME: Process-local registry with injected clock, inactivity sweeping and a background sweeper

use crate::error::SandboxError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Stopped,
    Creating,
    Syncing,
    Running,
    Error,
}

impl ContainerStatus {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        self == next
            || matches!(
                (self, next),
                (Stopped, Creating)
                    | (Creating, Syncing | Running | Error | Stopped)
                    | (Syncing, Running | Error | Stopped)
                    | (Running, Syncing | Creating | Stopped | Error)
                    | (Error, Creating | Stopped)
            )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Creating => "creating",
            ContainerStatus::Syncing => "syncing",
            ContainerStatus::Running => "running",
            ContainerStatus::Error => "error",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub status: ContainerStatus,
    pub message: String,
    pub last_activity: DateTime<Utc>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedEvent {
    pub project_id: String,
    pub subscriber_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdatedEvent {
    pub project_id: String,
    pub filename: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatusEvent {
    pub project_id: String,
    pub status: ContainerStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewUpdatedEvent {
    pub project_id: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStateEvent {
    pub project_id: String,
    pub status: ContainerStatus,
    pub message: String,
    pub last_activity: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Events pushed to subscribers, serialized as `{"type": ..., "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum StatusEvent {
    Connected(ConnectedEvent),
    FileUpdated(FileUpdatedEvent),
    ContainerStatus(ContainerStatusEvent),
    PreviewUpdated(PreviewUpdatedEvent),
    ProjectState(ProjectStateEvent),
}

impl StatusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::Connected(_) => "connected",
            StatusEvent::FileUpdated(_) => "file-updated",
            StatusEvent::ContainerStatus(_) => "container-status",
            StatusEvent::PreviewUpdated(_) => "preview-updated",
            StatusEvent::ProjectState(_) => "project-state",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","data":{{"message":"{}"}}}}"#, e)
        })
    }
}

struct Subscriber {
    id: Uuid,
    sender: mpsc::UnboundedSender<StatusEvent>,
}

#[derive(Default)]
struct Registry {
    statuses: HashMap<String, ProjectStatus>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

impl Registry {
    /// Deliver to every subscriber of the project, dropping those whose channel is closed
    fn fan_out(&mut self, project_id: &str, event: &StatusEvent) -> usize {
        let Some(subscribers) = self.subscribers.get_mut(project_id) else {
            return 0;
        };
        subscribers.retain(|subscriber| match subscriber.sender.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    "Dropping subscriber {} of project {} after failed send",
                    subscriber.id, project_id
                );
                false
            }
        });
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            self.subscribers.remove(project_id);
        }
        delivered
    }
}

/// Status records and subscriber sets for every project in this process
pub struct StatusRegistry {
    inner: Mutex<Registry>,
    clock: Arc<dyn Clock>,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl StatusRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            clock,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current status; unknown projects read as stopped
    pub fn get_status(&self, project_id: &str) -> ProjectStatus {
        self.cached(project_id).unwrap_or_else(|| ProjectStatus {
            status: ContainerStatus::Stopped,
            message: "Sandbox not created".to_string(),
            last_activity: self.clock.now(),
        })
    }

    /// The stored record, if the project has one
    pub fn cached(&self, project_id: &str) -> Option<ProjectStatus> {
        self.registry().statuses.get(project_id).cloned()
    }

    /// Move a project to `status` along a permitted edge and notify subscribers
    pub fn set_status(
        &self,
        project_id: &str,
        status: ContainerStatus,
        message: impl Into<String>,
    ) -> Result<ProjectStatus, SandboxError> {
        let message = message.into();
        let mut registry = self.registry();

        let current = registry
            .statuses
            .get(project_id)
            .map(|s| s.status)
            .unwrap_or(ContainerStatus::Stopped);
        if !current.can_transition_to(status) {
            warn!(
                "Rejected status change for project {}: {} -> {}",
                project_id, current, status
            );
            return Err(SandboxError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        Ok(self.apply(&mut registry, project_id, status, message))
    }

    /// Record a status read back from the backend, bypassing edge validation
    pub fn observe(
        &self,
        project_id: &str,
        status: ContainerStatus,
        message: impl Into<String>,
    ) -> ProjectStatus {
        let mut registry = self.registry();
        self.apply(&mut registry, project_id, status, message.into())
    }

    fn apply(
        &self,
        registry: &mut Registry,
        project_id: &str,
        status: ContainerStatus,
        message: String,
    ) -> ProjectStatus {
        let now = self.clock.now();
        let record = ProjectStatus {
            status,
            message: message.clone(),
            last_activity: now,
        };
        registry
            .statuses
            .insert(project_id.to_string(), record.clone());
        info!("Project {} is {}: {}", project_id, status, message);

        let event = StatusEvent::ContainerStatus(ContainerStatusEvent {
            project_id: project_id.to_string(),
            status,
            message,
            timestamp: now,
        });
        registry.fan_out(project_id, &event);
        record
    }

    /// Refresh the activity timestamp without changing status
    pub fn touch(&self, project_id: &str) {
        let now = self.clock.now();
        if let Some(record) = self.registry().statuses.get_mut(project_id) {
            record.last_activity = now;
        }
    }

    /// Send an event to every subscriber of the project. Returns how many received it.
    pub fn broadcast(&self, project_id: &str, event: StatusEvent) -> usize {
        self.registry().fan_out(project_id, &event)
    }

    /// Register a raw channel. The caller owns its lifetime; closing it unsubscribes on next send.
    pub fn register(
        &self,
        project_id: &str,
        sender: mpsc::UnboundedSender<StatusEvent>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = self.clock.now();
        let mut registry = self.registry();

        let _ = sender.send(StatusEvent::Connected(ConnectedEvent {
            project_id: project_id.to_string(),
            subscriber_id: id,
            timestamp: now,
        }));
        if let Some(record) = registry.statuses.get(project_id) {
            let _ = sender.send(StatusEvent::ProjectState(ProjectStateEvent {
                project_id: project_id.to_string(),
                status: record.status,
                message: record.message.clone(),
                last_activity: record.last_activity,
                timestamp: now,
            }));
        }

        registry
            .subscribers
            .entry(project_id.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        debug!("Subscriber {} joined project {}", id, project_id);
        id
    }

    /// Subscribe with a handle that unsubscribes when dropped
    pub fn subscribe(self: &Arc<Self>, project_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.register(project_id, sender);
        Subscription {
            id,
            project_id: project_id.to_string(),
            receiver,
            registry: Arc::downgrade(self),
        }
    }

    /// Returns whether the subscriber was registered
    pub fn unsubscribe(&self, project_id: &str, subscriber_id: Uuid) -> bool {
        let mut registry = self.registry();
        let Some(subscribers) = registry.subscribers.get_mut(project_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscriber_id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            registry.subscribers.remove(project_id);
        }
        if removed {
            debug!("Subscriber {} left project {}", subscriber_id, project_id);
        }
        removed
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.registry()
            .subscribers
            .get(project_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop status records idle for longer than `expiry`. Returns the purged project ids.
    pub fn sweep(&self, expiry: Duration) -> Vec<String> {
        let expiry = chrono::Duration::from_std(expiry)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let now = self.clock.now();
        let mut registry = self.registry();

        let expired: Vec<String> = registry
            .statuses
            .iter()
            .filter(|(_, record)| now - record.last_activity > expiry)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            registry.statuses.remove(id);
        }
        if !expired.is_empty() {
            info!("Purged {} idle project status record(s)", expired.len());
        }
        expired
    }
}

/// Receiving side of a subscription
pub struct Subscription {
    id: Uuid,
    project_id: String,
    receiver: mpsc::UnboundedReceiver<StatusEvent>,
    registry: Weak<StatusRegistry>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.project_id, self.id);
        }
    }
}

/// Periodically purges idle status records
pub struct StatusSweeper {
    registry: Arc<StatusRegistry>,
    interval: Duration,
    expiry: Duration,
    running: Arc<RwLock<bool>>,
}

impl StatusSweeper {
    pub fn new(registry: Arc<StatusRegistry>, interval: Duration, expiry: Duration) -> Self {
        Self {
            registry,
            interval,
            expiry,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return; // Already running
        }
        *running = true;
        drop(running);

        let registry = self.registry.clone();
        let running_flag = self.running.clone();
        let interval = self.interval;
        let expiry = self.expiry;

        tokio::spawn(async move {
            info!("Status sweeper started");
            loop {
                if !*running_flag.read().await {
                    info!("Status sweeper stopped");
                    break;
                }
                registry.sweep(expiry);
                tokio::time::sleep(interval).await;
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry_with_clock() -> (Arc<ManualClock>, Arc<StatusRegistry>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (clock.clone(), Arc::new(StatusRegistry::new(clock)))
    }

    #[test]
    fn test_transition_table() {
        use ContainerStatus::*;
        let allowed = [
            (Stopped, Creating),
            (Creating, Syncing),
            (Creating, Running),
            (Creating, Error),
            (Creating, Stopped),
            (Syncing, Running),
            (Syncing, Error),
            (Syncing, Stopped),
            (Running, Syncing),
            (Running, Creating),
            (Running, Stopped),
            (Running, Error),
            (Error, Creating),
            (Error, Stopped),
        ];
        let all = [Stopped, Creating, Syncing, Running, Error];
        for from in all {
            for to in all {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_unknown_project_reads_stopped() {
        let registry = StatusRegistry::default();
        assert_eq!(registry.get_status("nope").status, ContainerStatus::Stopped);
        assert!(registry.cached("nope").is_none());
    }

    #[test]
    fn test_invalid_transition_leaves_record_unchanged() {
        let registry = StatusRegistry::default();
        let err = registry
            .set_status("p1", ContainerStatus::Running, "skip ahead")
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidTransition { .. }));
        assert!(registry.cached("p1").is_none());

        registry
            .set_status("p1", ContainerStatus::Creating, "starting")
            .unwrap();
        registry
            .set_status("p1", ContainerStatus::Syncing, "pushing")
            .unwrap();
        assert!(registry
            .set_status("p1", ContainerStatus::Creating, "back")
            .is_err());
        assert_eq!(registry.get_status("p1").status, ContainerStatus::Syncing);
    }

    #[test]
    fn test_observe_bypasses_edges() {
        let registry = StatusRegistry::default();
        registry.observe("p1", ContainerStatus::Running, "found running");
        assert_eq!(registry.get_status("p1").status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_subscribe_sends_connected_then_state() {
        let (_, registry) = registry_with_clock();
        registry
            .set_status("p1", ContainerStatus::Creating, "starting")
            .unwrap();

        let mut subscription = registry.subscribe("p1");
        let connected = subscription.recv().await.unwrap();
        assert_eq!(connected.kind(), "connected");
        match subscription.recv().await.unwrap() {
            StatusEvent::ProjectState(state) => {
                assert_eq!(state.status, ContainerStatus::Creating);
                assert_eq!(state.message, "starting");
            }
            other => panic!("unexpected event {:?}", other),
        }

        registry
            .set_status("p1", ContainerStatus::Running, "up")
            .unwrap();
        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind(), "container-status");
    }

    #[test]
    fn test_fresh_project_subscription_gets_only_connected() {
        let registry = Arc::new(StatusRegistry::default());
        let mut subscription = registry.subscribe("p1");
        assert_eq!(subscription.try_recv().unwrap().kind(), "connected");
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_fan_out_isolates_broken_subscriber() {
        let registry = StatusRegistry::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        registry.register("p1", tx1);
        registry.register("p1", tx2);
        registry.register("p1", tx3);
        drop(rx2);

        registry
            .set_status("p1", ContainerStatus::Creating, "starting")
            .unwrap();

        assert_eq!(registry.subscriber_count("p1"), 2);
        for rx in [&mut rx1, &mut rx3] {
            assert_eq!(rx.try_recv().unwrap().kind(), "connected");
            assert_eq!(rx.try_recv().unwrap().kind(), "container-status");
        }
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let registry = Arc::new(StatusRegistry::default());
        let first = registry.subscribe("p1");
        let _second = registry.subscribe("p1");
        assert_eq!(registry.subscriber_count("p1"), 2);

        drop(first);
        assert_eq!(registry.subscriber_count("p1"), 1);
        assert!(!registry.unsubscribe("p1", Uuid::new_v4()));
    }

    #[test]
    fn test_events_serialize_with_type_and_camel_case_data() {
        let event = StatusEvent::ContainerStatus(ContainerStatusEvent {
            project_id: "p1".to_string(),
            status: ContainerStatus::Running,
            message: "up".to_string(),
            timestamp: Utc::now(),
        });
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["type"], "container-status");
        assert_eq!(json["data"]["projectId"], "p1");
        assert_eq!(json["data"]["status"], "running");
        assert!(json["data"]["timestamp"].is_string());
    }

    #[test]
    fn test_sweep_purges_idle_projects() {
        let (clock, registry) = registry_with_clock();
        registry
            .set_status("old", ContainerStatus::Creating, "starting")
            .unwrap();
        clock.advance(chrono::Duration::hours(23));
        registry
            .set_status("fresh", ContainerStatus::Creating, "starting")
            .unwrap();
        clock.advance(chrono::Duration::hours(2));

        let purged = registry.sweep(Duration::from_secs(24 * 3600));
        assert_eq!(purged, vec!["old".to_string()]);
        assert!(registry.cached("old").is_none());
        assert!(registry.cached("fresh").is_some());
    }

    #[tokio::test]
    async fn test_sweeper_start_stop() {
        let registry = Arc::new(StatusRegistry::default());
        let sweeper = StatusSweeper::new(
            registry,
            Duration::from_millis(5),
            Duration::from_secs(3600),
        );
        sweeper.start().await;
        assert!(sweeper.is_running().await);
        sweeper.stop().await;
        assert!(!sweeper.is_running().await);
    }
}
