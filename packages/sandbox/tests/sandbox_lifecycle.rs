// ABOUTME: Integration tests for start, stop, restart and status against the in-memory backend
// ABOUTME: Covers background readiness, idempotent starts, failure reporting and cleanup

use skiff_sandbox::endpoint::{endpoint_name, port_for, sandbox_name, startup_config_name};
use skiff_sandbox::status::ContainerStatusEvent;
use skiff_sandbox::{
    ContainerStatus, FileStore, MemoryBackend, MemoryFileStore, Runtime, SandboxError,
    SandboxManager, SandboxObservation, SandboxPhase, SandboxSettings, StatusEvent, Subscription,
};
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (SandboxManager, Arc<MemoryBackend>, Arc<MemoryFileStore>) {
    let backend = Arc::new(MemoryBackend::new());
    let files = Arc::new(MemoryFileStore::new());
    let manager = SandboxManager::new(
        backend.clone(),
        files.clone(),
        SandboxSettings::immediate(),
    );
    (manager, backend, files)
}

async fn wait_for<F>(subscription: &mut Subscription, matches: F) -> StatusEvent
where
    F: Fn(&StatusEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match subscription.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_preview(event: &StatusEvent) -> bool {
    matches!(event, StatusEvent::PreviewUpdated(_))
}

fn is_status(status: ContainerStatus) -> impl Fn(&StatusEvent) -> bool {
    move |event| {
        matches!(event, StatusEvent::ContainerStatus(ContainerStatusEvent { status: s, .. }) if *s == status)
    }
}

#[tokio::test]
async fn test_start_reaches_running_and_announces_preview() {
    let (manager, backend, files) = setup().await;
    files
        .save_file("proj1", "index.html", b"<h1>hi</h1>")
        .await
        .unwrap();
    let mut subscription = manager.subscribe("proj1");

    let response = manager.start("proj1", Runtime::Node).await.unwrap();
    assert_eq!(response.status, ContainerStatus::Creating);
    assert_eq!(
        response.endpoint_url,
        format!("http://localhost:{}", port_for("proj1"))
    );

    let event = wait_for(&mut subscription, is_preview).await;
    match event {
        StatusEvent::PreviewUpdated(preview) => assert_eq!(preview.url, response.endpoint_url),
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(
        manager.cached_status("proj1").unwrap().status,
        ContainerStatus::Running
    );
    assert_eq!(
        backend.file(&sandbox_name("proj1"), "/workspace/index.html"),
        Some(b"<h1>hi</h1>".to_vec())
    );
    assert!(backend.endpoint_exists(&endpoint_name("proj1")));
    assert!(backend.startup_config(&startup_config_name("proj1")).is_some());
}

#[tokio::test]
async fn test_status_events_follow_creating_syncing_running() {
    let (manager, _backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");

    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_status(ContainerStatus::Creating)).await;
    wait_for(&mut subscription, is_status(ContainerStatus::Syncing)).await;
    wait_for(&mut subscription, is_status(ContainerStatus::Running)).await;
    wait_for(&mut subscription, is_preview).await;
}

#[tokio::test]
async fn test_start_when_running_creates_nothing() {
    let (manager, backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    backend.clear_calls();
    let response = manager.start("proj1", Runtime::Node).await.unwrap();

    assert_eq!(response.status, ContainerStatus::Running);
    let creates = backend
        .calls()
        .iter()
        .filter(|call| call.op.starts_with("create_"))
        .count();
    assert_eq!(creates, 0);
}

#[tokio::test]
async fn test_stop_keeps_endpoint_and_reports_stopped() {
    let (manager, backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    let status = manager.stop("proj1").await.unwrap();
    assert_eq!(status, ContainerStatus::Stopped);
    assert!(!backend.sandbox_exists(&sandbox_name("proj1")));
    assert!(backend.endpoint_exists(&endpoint_name("proj1")));

    let report = manager.status("proj1").await.unwrap();
    assert_eq!(report.status, ContainerStatus::Stopped);
    assert_eq!(report.message, "Sandbox not created");
    assert_eq!(report.endpoint_url, None);
}

#[tokio::test]
async fn test_stop_of_absent_sandbox_succeeds() {
    let (manager, _backend, _files) = setup().await;
    assert_eq!(manager.stop("ghost").await.unwrap(), ContainerStatus::Stopped);
}

#[tokio::test]
async fn test_status_of_running_sandbox_includes_url() {
    let (manager, _backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    let report = manager.status("proj1").await.unwrap();
    assert_eq!(report.status, ContainerStatus::Running);
    assert_eq!(report.endpoint_url, Some(manager.endpoint_url("proj1")));
}

#[tokio::test]
async fn test_status_reports_waiting_reason() {
    let (manager, backend, _files) = setup().await;
    backend.set_initial_phase(SandboxPhase::Pending, false);
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_status(ContainerStatus::Syncing)).await;

    backend.set_waiting_reason(&sandbox_name("proj1"), Some("ImagePullBackOff"));
    let report = manager.status("proj1").await.unwrap();
    assert_eq!(report.status, ContainerStatus::Creating);
    assert!(report.message.contains("ImagePullBackOff"), "{}", report.message);
}

#[tokio::test]
async fn test_failed_sandbox_moves_project_to_error() {
    let (manager, backend, _files) = setup().await;
    backend.set_initial_phase(SandboxPhase::Failed, false);
    let mut subscription = manager.subscribe("proj1");

    let response = manager.start("proj1", Runtime::Node).await.unwrap();
    assert_eq!(response.status, ContainerStatus::Creating);

    wait_for(&mut subscription, is_status(ContainerStatus::Error)).await;
    assert_eq!(
        manager.cached_status("proj1").unwrap().status,
        ContainerStatus::Error
    );
}

#[tokio::test(start_paused = true)]
async fn test_sandbox_that_never_becomes_ready_times_out() {
    let (manager, backend, _files) = setup().await;
    backend.set_initial_phase(SandboxPhase::Pending, false);
    let mut subscription = manager.subscribe("proj1");

    manager.start("proj1", Runtime::Node).await.unwrap();

    let event = wait_for(&mut subscription, is_status(ContainerStatus::Error)).await;
    match event {
        StatusEvent::ContainerStatus(status) => {
            assert!(status.message.contains("not ready"), "{}", status.message)
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_error_project_can_start_again() {
    let (manager, backend, _files) = setup().await;
    backend.set_initial_phase(SandboxPhase::Failed, false);
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_status(ContainerStatus::Error)).await;

    manager.stop("proj1").await.unwrap();
    backend.set_initial_phase(SandboxPhase::Running, true);
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    assert_eq!(
        manager.cached_status("proj1").unwrap().status,
        ContainerStatus::Running
    );
}

#[tokio::test]
async fn test_start_after_stop_with_other_runtime_uses_its_bootstrap() {
    let (manager, backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_preview).await;
    manager.stop("proj1").await.unwrap();

    manager.start("proj1", Runtime::Python).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    let observed = manager
        .resources()
        .get_sandbox_status("proj1")
        .await
        .unwrap();
    assert_eq!(observed.runtime(), Some(Runtime::Python));

    let config = backend
        .startup_config(&startup_config_name("proj1"))
        .unwrap();
    let script = &config.files["startup.sh"];
    assert!(script.contains("# Sandbox bootstrap (python)"), "{}", script);
}

#[tokio::test]
async fn test_concurrent_starts_create_one_sandbox() {
    let (manager, backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");

    let (first, second) = tokio::join!(
        manager.start("proj1", Runtime::Node),
        manager.start("proj1", Runtime::Node)
    );
    let mut statuses = vec![first.unwrap().status, second.unwrap().status];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![ContainerStatus::Creating, ContainerStatus::Running]);

    wait_for(&mut subscription, is_preview).await;
    let creates = backend
        .calls()
        .iter()
        .filter(|call| call.op == "create_sandbox")
        .count();
    assert_eq!(creates, 1);
    assert_eq!(
        manager.cached_status("proj1").unwrap().status,
        ContainerStatus::Running
    );
}

#[tokio::test]
async fn test_stop_waits_for_start_to_settle() {
    let (manager, backend, _files) = setup().await;
    backend.set_initial_phase(SandboxPhase::Pending, false);
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_status(ContainerStatus::Syncing)).await;

    let stopper = manager.clone();
    let stop = tokio::spawn(async move { stopper.stop("proj1").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stop.is_finished());
    assert!(backend.sandbox_exists(&sandbox_name("proj1")));

    backend.set_phase(&sandbox_name("proj1"), SandboxPhase::Running, true);
    wait_for(&mut subscription, is_preview).await;
    wait_for(&mut subscription, is_status(ContainerStatus::Stopped)).await;

    assert_eq!(stop.await.unwrap().unwrap(), ContainerStatus::Stopped);
    assert!(!backend.sandbox_exists(&sandbox_name("proj1")));
    assert_eq!(
        manager.cached_status("proj1").unwrap().status,
        ContainerStatus::Stopped
    );
}

#[tokio::test]
async fn test_restart_recreates_with_same_runtime() {
    let (manager, backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Python).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    backend.clear_calls();
    let status = manager.restart("proj1").await.unwrap();
    assert_eq!(status, ContainerStatus::Creating);
    wait_for(&mut subscription, is_preview).await;

    let ops: Vec<&'static str> = backend.calls().iter().map(|call| call.op).collect();
    let deleted = ops.iter().position(|op| *op == "delete_sandbox").unwrap();
    let created = ops.iter().position(|op| *op == "create_sandbox").unwrap();
    assert!(deleted < created);

    let observed = manager
        .resources()
        .get_sandbox_status("proj1")
        .await
        .unwrap();
    assert!(matches!(observed, SandboxObservation::Present { .. }));
    assert_eq!(observed.runtime(), Some(Runtime::Python));
}

#[tokio::test]
async fn test_restart_of_absent_sandbox_starts_node() {
    let (manager, _backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");

    manager.restart("proj1").await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    let observed = manager
        .resources()
        .get_sandbox_status("proj1")
        .await
        .unwrap();
    assert_eq!(observed.runtime(), Some(Runtime::Node));
}

#[tokio::test]
async fn test_invalid_project_id_touches_nothing() {
    let (manager, backend, _files) = setup().await;

    let result = manager.start("bad id", Runtime::Node).await;
    assert!(matches!(result, Err(SandboxError::InvalidProjectId(_))));
    assert!(matches!(
        manager.stop("../x").await,
        Err(SandboxError::InvalidProjectId(_))
    ));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_connection_check_follows_backend() {
    let (manager, backend, _files) = setup().await;
    assert!(manager.check_connection().await);

    backend.set_reachable(false);
    assert!(!manager.check_connection().await);
}

#[tokio::test]
async fn test_file_updates_reach_subscribers() {
    let (manager, _backend, _files) = setup().await;
    let mut first = manager.subscribe("proj1");
    let mut second = manager.subscribe("proj1");
    let _other = manager.subscribe("proj2");

    let delivered = manager.notify_file_updated("proj1", "app.js", "console.log(1)");
    assert_eq!(delivered, 2);

    for subscription in [&mut first, &mut second] {
        let event = wait_for(subscription, |e| matches!(e, StatusEvent::FileUpdated(_))).await;
        match event {
            StatusEvent::FileUpdated(update) => {
                assert_eq!(update.filename, "app.js");
                assert_eq!(update.content, "console.log(1)");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    let id = first.id();
    assert!(manager.unsubscribe("proj1", id));
    assert_eq!(manager.notify_file_updated("proj1", "app.js", "x"), 1);
}

#[tokio::test]
async fn test_cleanup_removes_every_resource() {
    let (manager, backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Go).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    let report = manager.cleanup("proj1").await.unwrap();
    assert!(report.is_clean(), "{:?}", report);
    assert!(!backend.sandbox_exists(&sandbox_name("proj1")));
    assert!(!backend.endpoint_exists(&endpoint_name("proj1")));
    assert!(backend.startup_config(&startup_config_name("proj1")).is_none());
    assert_eq!(
        manager.cached_status("proj1").unwrap().status,
        ContainerStatus::Stopped
    );
}

#[tokio::test]
async fn test_cleanup_all_covers_every_project() {
    let (manager, backend, _files) = setup().await;
    for project in ["alpha", "beta"] {
        let mut subscription = manager.subscribe(project);
        manager.start(project, Runtime::Node).await.unwrap();
        wait_for(&mut subscription, is_preview).await;
    }

    let reports = manager.cleanup_all().await.unwrap();
    let mut projects: Vec<&str> = reports.iter().map(|(id, _)| id.as_str()).collect();
    projects.sort();
    assert_eq!(projects, vec!["alpha", "beta"]);
    assert!(!backend.sandbox_exists(&sandbox_name("alpha")));
    assert!(!backend.sandbox_exists(&sandbox_name("beta")));
}

#[tokio::test]
async fn test_logs_come_from_the_sandbox() {
    let (manager, backend, _files) = setup().await;
    let mut subscription = manager.subscribe("proj1");
    manager.start("proj1", Runtime::Node).await.unwrap();
    wait_for(&mut subscription, is_preview).await;

    backend.push_log(&sandbox_name("proj1"), "listening on 3000");
    let logs = manager.logs("proj1", 1).await.unwrap();
    assert_eq!(logs, "listening on 3000");
}
