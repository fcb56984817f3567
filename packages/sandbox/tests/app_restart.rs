// ABOUTME: Integration tests for in-place application restarts inside running sandboxes
// ABOUTME: Failures are absorbed into broadcast, recovery or abandon outcomes instead of errors

use skiff_sandbox::endpoint::sandbox_name;
use skiff_sandbox::restart::{Signal, RECOVERY_SCRIPT};
use skiff_sandbox::{
    MemoryBackend, MemoryFileStore, RestartOutcome, Runtime, SandboxManager, SandboxPhase,
    SandboxSettings, StatusEvent,
};
use std::sync::Arc;
use std::time::Duration;

async fn running_project(project_id: &str) -> (SandboxManager, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let manager = SandboxManager::new(
        backend.clone(),
        Arc::new(MemoryFileStore::new()),
        SandboxSettings::immediate(),
    );

    let mut subscription = manager.subscribe(project_id);
    manager.start(project_id, Runtime::Python).await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = subscription.recv().await {
            if matches!(event, StatusEvent::PreviewUpdated(_)) {
                break;
            }
        }
    })
    .await
    .expect("sandbox never became ready");

    (manager, backend)
}

#[tokio::test]
async fn test_known_framework_is_signalled() {
    let (manager, backend) = running_project("proj1").await;
    let sandbox = sandbox_name("proj1");
    backend.set_processes(
        &sandbox,
        &[
            (1, "sh /scripts/startup.sh"),
            (30, "sh -c gunicorn app:app"),
            (31, "/usr/local/bin/python /usr/local/bin/gunicorn app:app"),
        ],
    );

    let outcome = manager.restart_app("proj1").await.unwrap();

    assert_eq!(
        outcome,
        RestartOutcome::Signalled {
            framework: "gunicorn".to_string(),
            pid: 31,
            signal: Signal::Hup,
        }
    );
    assert_eq!(backend.signals(&sandbox), vec![(31, "HUP".to_string())]);
}

#[tokio::test]
async fn test_unknown_processes_get_broadcast() {
    let (manager, backend) = running_project("proj1").await;
    let sandbox = sandbox_name("proj1");
    backend.set_processes(&sandbox, &[(1, "sh /scripts/startup.sh"), (9, "sleep 100")]);

    let outcome = manager.restart_app("proj1").await.unwrap();

    assert_eq!(outcome, RestartOutcome::Broadcast);
}

#[tokio::test]
async fn test_listing_failure_relaunches_start_command() {
    let (manager, backend) = running_project("proj1").await;
    backend.fail_exec_containing("/proc/[0-9]*");

    let outcome = manager.restart_app("proj1").await.unwrap();
    assert_eq!(outcome, RestartOutcome::Recovered);

    let relaunched = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let found = backend
                .calls()
                .iter()
                .any(|call| call.op == "exec" && call.target.contains(RECOVERY_SCRIPT));
            if found {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(relaunched.is_ok(), "recovery script was never executed");
}

#[tokio::test]
async fn test_restart_is_abandoned_when_sandbox_stopped_running() {
    let (manager, backend) = running_project("proj1").await;
    backend.set_phase(&sandbox_name("proj1"), SandboxPhase::Failed, false);

    let outcome = manager.restart_app("proj1").await.unwrap();

    assert_eq!(outcome, RestartOutcome::Abandoned);
}

#[tokio::test]
async fn test_restart_of_missing_sandbox_is_abandoned() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = SandboxManager::new(
        backend,
        Arc::new(MemoryFileStore::new()),
        SandboxSettings::immediate(),
    );

    let outcome = manager.restart_app("ghost").await.unwrap();

    assert_eq!(outcome, RestartOutcome::Abandoned);
}
