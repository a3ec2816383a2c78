//! Integration tests for start/stop/quit against a fake backend.

use std::path::PathBuf;
use std::time::Duration;

use workshop::Status;
use workshop::WorkshopError;
use workshop_test_utils::{
    Call, PROJECTS_DIR_KEY, StaticPrerequisite, TestContext, drain_statuses, wait_until,
};

const SHORT: Duration = Duration::from_millis(200);
const FULL: Duration = Duration::from_millis(500);

// ============================================================================
// START
// ============================================================================

#[tokio::test]
async fn start_walks_through_create_and_start_then_guest_reports_running() {
    let ctx = TestContext::new().await;
    let mut rx = ctx.controller.subscribe();

    ctx.start_running().await;

    let seen = drain_statuses(&mut rx);
    assert_eq!(
        seen,
        vec![
            Status::Creating,
            Status::Created,
            Status::Starting,
            Status::Running
        ]
    );
    assert!(ctx.controller.relay_addr().is_some());
    let backend = ctx.backends.latest().unwrap();
    assert_eq!(backend.calls(), vec![Call::Create, Call::Start]);
}

#[tokio::test]
async fn start_while_held_fails_with_already_running() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;

    let err = ctx.controller.start().await.unwrap_err();
    assert!(matches!(err, WorkshopError::AlreadyRunning));
    assert_eq!(ctx.controller.status(), Status::Running);
    assert_eq!(ctx.backends.created().len(), 1);
}

#[tokio::test]
async fn guest_silence_leaves_status_at_starting() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.boot_signal = false);

    ctx.controller.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(ctx.controller.status(), Status::Starting);
}

#[tokio::test]
async fn guest_statuses_are_forwarded() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.boot_signal = false);
    ctx.controller.start().await.unwrap();

    let backend = ctx.backends.latest().unwrap();
    backend.emit("cloud-init: starting services");
    backend.signal(Status::Running);
    assert!(ctx.wait_for_status(Status::Running).await);
}

#[tokio::test]
async fn machine_params_follow_host_share_and_mounts() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;

    let params = ctx.backends.latest().unwrap().params().unwrap();
    // 8 CPUs / 16 GiB host
    assert_eq!(params.cpus, 6);
    assert_eq!(params.memory_bytes, 12 * 1024 * 1024 * 1024);
    assert_eq!(params.mounts[0].host_path, ctx.projects_dir);
    assert_eq!(params.mounts[0].guest_path, "/noop/projects");
    assert_eq!(params.mounts[1].guest_path, "/noop/data");
    assert!(params.mounts[1].writable);
    assert!(params.port_forwards.iter().any(|p| p.guest_port == 443));
    assert!(params.port_forwards.iter().any(|p| p.guest_port == 1234));
    assert!(params.boot_disk.is_file());
    assert!(params.boot_disk.starts_with(ctx.controller.layout().disks_dir()));
}

#[tokio::test]
async fn create_failure_reports_create_failed() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.create_error = Some("disk full".into()));

    let err = ctx.controller.start().await.unwrap_err();
    assert!(err.to_string().contains("disk full"));
    assert_eq!(ctx.controller.status(), Status::CreateFailed);
}

#[tokio::test]
async fn start_failure_reports_start_failed() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.start_error = Some("hypervisor busy".into()));

    assert!(ctx.controller.start().await.is_err());
    assert_eq!(ctx.controller.status(), Status::StartFailed);
    assert!(ctx.controller.relay_addr().is_none());
}

#[tokio::test]
async fn failed_boot_releases_the_machine_so_start_can_be_retried() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.start_error = Some("hypervisor busy".into()));

    assert!(ctx.controller.start().await.is_err());
    assert_eq!(ctx.controller.status(), Status::StartFailed);
    let failed = ctx.backends.latest().unwrap();
    assert_eq!(
        failed.calls(),
        vec![Call::Create, Call::Start, Call::Stop(SHORT)]
    );

    ctx.backends.script(|s| s.start_error = None);
    ctx.start_running().await;
    assert_eq!(ctx.backends.created().len(), 2);
}

#[tokio::test]
async fn start_can_be_retried_after_failed_create() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.create_error = Some("disk full".into()));
    assert!(ctx.controller.start().await.is_err());
    assert_eq!(ctx.controller.status(), Status::CreateFailed);

    ctx.backends.script(|s| s.create_error = None);
    ctx.start_running().await;
    assert!(ctx.controller.relay_addr().is_some());
}

#[tokio::test]
async fn missing_base_image_is_fatal_and_shown() {
    let ctx = TestContext::new().await;
    for entry in std::fs::read_dir(ctx.controller.layout().resources_dir()).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let err = ctx.controller.start().await.unwrap_err();
    assert!(matches!(err, WorkshopError::PrerequisiteMissing(_)));
    assert_eq!(ctx.controller.status(), Status::CreateFailed);
    assert_eq!(ctx.prompter.errors().len(), 1);
    assert!(ctx.backends.created().is_empty());
}

// ============================================================================
// PREREQUISITES
// ============================================================================

#[tokio::test]
async fn missing_prerequisite_is_installed_after_confirmation() {
    let ctx = TestContext::builder()
        .prerequisite(StaticPrerequisite::new(false, true, None))
        .build()
        .await;
    let mut rx = ctx.controller.subscribe();
    ctx.prompter.answer_confirm(true);

    ctx.start_running().await;

    assert_eq!(ctx.prerequisite.installs(), 1);
    assert_eq!(drain_statuses(&mut rx).first(), Some(&Status::WslInstalling));
}

#[tokio::test]
async fn declined_install_reports_install_failed() {
    let ctx = TestContext::builder()
        .prerequisite(StaticPrerequisite::new(false, true, None))
        .build()
        .await;
    ctx.prompter.answer_confirm(false);

    assert!(ctx.controller.start().await.is_err());
    assert_eq!(ctx.controller.status(), Status::WslInstallFailed);
    assert_eq!(ctx.prerequisite.installs(), 0);
}

#[tokio::test]
async fn failed_install_reports_install_failed() {
    let ctx = TestContext::builder()
        .prerequisite(StaticPrerequisite::new(false, true, Some("no network".into())))
        .build()
        .await;

    assert!(ctx.controller.start().await.is_err());
    assert_eq!(ctx.controller.status(), Status::WslInstallFailed);
    assert_eq!(ctx.prerequisite.installs(), 1);
}

#[tokio::test]
async fn uninstallable_prerequisite_is_shown_to_user() {
    let ctx = TestContext::builder()
        .prerequisite(StaticPrerequisite::new(false, false, None))
        .build()
        .await;

    let err = ctx.controller.start().await.unwrap_err();
    assert!(matches!(err, WorkshopError::PrerequisiteMissing(_)));
    assert_eq!(ctx.controller.status(), Status::CreateFailed);
    assert_eq!(ctx.prompter.errors().len(), 1);
}

// ============================================================================
// PROJECTS DIRECTORY
// ============================================================================

#[tokio::test]
async fn prompt_loops_until_valid_directory_and_persists_it() {
    let ctx = TestContext::builder().without_projects_dir().build().await;
    ctx.prompter.answer_directory(None);
    ctx.prompter.answer_directory(Some(PathBuf::from("/")));
    ctx.prompter.answer_directory(Some(ctx.projects_dir.clone()));

    ctx.start_running().await;

    let prompts = ctx.prompter.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[2].contains("must be inside"));
    assert_eq!(
        ctx.settings.value(PROJECTS_DIR_KEY),
        Some(ctx.projects_dir.to_string_lossy().into_owned())
    );
}

#[tokio::test]
async fn invalid_stored_directory_prompts_again() {
    let ctx = TestContext::new().await;
    ctx.settings.put(PROJECTS_DIR_KEY, "/definitely/not/here");
    ctx.prompter.answer_directory(Some(ctx.projects_dir.clone()));

    ctx.start_running().await;

    let prompts = ctx.prompter.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("does not exist"));
}

#[tokio::test]
async fn stop_during_pending_prompt_never_yields_running() {
    let ctx = TestContext::builder().without_projects_dir().build().await;
    let mut rx = ctx.controller.subscribe();

    let controller = ctx.controller.clone();
    let start = tokio::spawn(async move { controller.start().await });
    let prompter = ctx.prompter.clone();
    assert!(wait_until(Duration::from_secs(2), move || !prompter.prompts().is_empty()).await);

    ctx.controller.stop(FULL).await.unwrap();
    start.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(ctx.controller.status(), Status::Stopped);
    assert!(!drain_statuses(&mut rx).contains(&Status::Running));
    assert!(ctx.backends.created().is_empty());
}

// ============================================================================
// STOP
// ============================================================================

#[tokio::test]
async fn stop_after_boot_asks_guest_first() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    let disk = ctx.backends.latest().unwrap().params().unwrap().boot_disk;

    ctx.controller.stop(FULL).await.unwrap();

    assert_eq!(ctx.controller.status(), Status::Stopped);
    assert_eq!(ctx.guest_api.stop_requests(), 1);
    let calls = ctx.backends.latest().unwrap().calls();
    assert_eq!(calls, vec![Call::Create, Call::Start, Call::Stop(FULL)]);
    assert!(ctx.controller.relay_addr().is_none());
    assert!(!disk.exists());
}

#[tokio::test]
async fn stop_before_boot_uses_short_grace() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.boot_signal = false);
    ctx.controller.start().await.unwrap();

    ctx.controller.stop(FULL).await.unwrap();

    assert_eq!(ctx.guest_api.stop_requests(), 0);
    let calls = ctx.backends.latest().unwrap().calls();
    assert_eq!(calls.last(), Some(&Call::Stop(SHORT)));
    assert_eq!(ctx.controller.status(), Status::Stopped);
}

#[tokio::test]
async fn slow_guest_falls_back_to_forced_stop_then_kill() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    ctx.guest_api.delay(Duration::from_secs(2));
    ctx.backends.script(|s| s.stop_delay = Duration::from_secs(1));

    ctx.controller.stop(FULL).await.unwrap();

    let calls = ctx.backends.latest().unwrap().calls();
    assert_eq!(
        calls,
        vec![Call::Create, Call::Start, Call::Stop(SHORT), Call::Kill]
    );
    assert_eq!(ctx.controller.status(), Status::Stopped);
}

#[tokio::test]
async fn failing_guest_api_falls_back_to_forced_stop() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    ctx.guest_api.fail_with("connection refused");

    ctx.controller.stop(FULL).await.unwrap();

    let calls = ctx.backends.latest().unwrap().calls();
    assert_eq!(calls.last(), Some(&Call::Stop(SHORT)));
    assert_eq!(ctx.controller.status(), Status::Stopped);
}

#[tokio::test]
async fn backend_stop_failure_reports_stop_failed_and_keeps_handle() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.boot_signal = false);
    ctx.controller.start().await.unwrap();
    ctx.backends.script(|s| {
        s.stop_error = Some("stuck".into());
        s.kill_error = Some("still stuck".into());
    });

    assert!(ctx.controller.stop(FULL).await.is_err());
    assert_eq!(ctx.controller.status(), Status::StopFailed);
    assert!(matches!(
        ctx.controller.start().await,
        Err(WorkshopError::AlreadyRunning)
    ));
}

#[tokio::test]
async fn stop_without_machine_is_harmless() {
    let ctx = TestContext::new().await;
    ctx.controller.stop(FULL).await.unwrap();
    assert_eq!(ctx.controller.status(), Status::Stopped);
    assert!(ctx.backends.created().is_empty());
}

#[tokio::test]
async fn machine_can_start_again_after_stop() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    ctx.controller.stop(FULL).await.unwrap();

    ctx.start_running().await;
    assert_eq!(ctx.backends.created().len(), 2);
}

// ============================================================================
// GENERATIONS
// ============================================================================

#[tokio::test]
async fn stop_during_create_wins() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.create_delay = Duration::from_millis(200));
    let mut rx = ctx.controller.subscribe();

    let controller = ctx.controller.clone();
    let start = tokio::spawn(async move { controller.start().await });
    let backends = ctx.backends.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            backends.latest().is_some_and(|b| b.calls().contains(&Call::Create))
        })
        .await
    );

    ctx.controller.stop(FULL).await.unwrap();
    start.await.unwrap().unwrap();

    assert_eq!(ctx.controller.status(), Status::Stopped);
    let seen = drain_statuses(&mut rx);
    assert_eq!(seen.last(), Some(&Status::Stopped));
    assert!(!seen.contains(&Status::Starting));
    assert!(!ctx.backends.latest().unwrap().calls().contains(&Call::Start));
}

#[tokio::test]
async fn stop_during_slow_boot_still_brings_machine_down() {
    let ctx = TestContext::new().await;
    ctx.backends.script(|s| s.start_delay = Duration::from_millis(300));
    let mut rx = ctx.controller.subscribe();

    let controller = ctx.controller.clone();
    let start = tokio::spawn(async move { controller.start().await });
    let backends = ctx.backends.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            backends.latest().is_some_and(|b| b.calls().contains(&Call::Start))
        })
        .await
    );

    ctx.controller.stop(Duration::from_millis(100)).await.unwrap();
    let backend = ctx.backends.latest().unwrap();
    let at_stop = backend.calls().len();
    start.await.unwrap().unwrap();

    // The boot completed after the stop; the machine must not be left running.
    let calls = backend.calls();
    assert!(calls.len() > at_stop);
    assert!(matches!(calls.last(), Some(Call::Stop(_) | Call::Kill)));
    assert_eq!(ctx.controller.status(), Status::Stopped);
    assert!(!drain_statuses(&mut rx).contains(&Status::Running));
    assert!(ctx.controller.relay_addr().is_none());
}

#[tokio::test]
async fn start_issued_during_slow_stop_wins() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    ctx.backends.script(|s| s.stop_delay = Duration::from_millis(150));
    ctx.guest_api.fail_with("guest gone");

    let controller = ctx.controller.clone();
    let stop = tokio::spawn(async move { controller.stop(FULL).await });
    assert!(ctx.wait_for_status(Status::Stopping).await);

    ctx.backends.script(|s| s.stop_delay = Duration::ZERO);
    ctx.start_running().await;
    stop.await.unwrap().unwrap();

    assert_eq!(ctx.controller.status(), Status::Running);
    let disk = ctx.backends.latest().unwrap().params().unwrap().boot_disk;
    assert!(disk.is_file());
}

#[tokio::test]
async fn resync_replays_current_status() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;

    let mut rx = ctx.controller.subscribe();
    assert_eq!(ctx.controller.resync(), Status::Running);
    assert_eq!(rx.recv().await.unwrap(), Status::Running);
}

// ============================================================================
// QUIT
// ============================================================================

#[tokio::test]
async fn quit_stops_and_deletes() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    let mut rx = ctx.controller.subscribe();

    ctx.controller.quit().await.unwrap();

    assert_eq!(
        drain_statuses(&mut rx),
        vec![
            Status::Stopping,
            Status::Stopped,
            Status::Deleting,
            Status::Deleted
        ]
    );
    let calls = ctx.backends.latest().unwrap().calls();
    assert_eq!(calls.last(), Some(&Call::Delete));
    assert!(ctx.controller.is_quitting());
}

#[tokio::test]
async fn quit_without_machine_still_deletes_by_name() {
    let ctx = TestContext::new().await;
    ctx.controller.quit().await.unwrap();

    assert_eq!(ctx.controller.status(), Status::Deleted);
    assert_eq!(ctx.backends.all_calls(), vec![Call::Delete]);
}

#[tokio::test]
async fn delete_failure_reports_delete_failed() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    ctx.backends.script(|s| s.delete_error = Some("busy".into()));

    assert!(ctx.controller.quit().await.is_err());
    assert_eq!(ctx.controller.status(), Status::DeleteFailed);
}

#[tokio::test]
async fn guest_running_after_quit_is_ignored() {
    let ctx = TestContext::new().await;
    ctx.start_running().await;
    let backend = ctx.backends.latest().unwrap();

    ctx.controller.quit().await.unwrap();
    backend.signal(Status::Running);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(ctx.controller.status(), Status::Deleted);
}

#[tokio::test]
async fn start_after_quit_is_ignored() {
    let ctx = TestContext::new().await;
    ctx.controller.quit().await.unwrap();
    let created = ctx.backends.created().len();

    ctx.controller.start().await.unwrap();

    assert_eq!(ctx.controller.status(), Status::Deleted);
    assert_eq!(ctx.backends.created().len(), created);
}
