//! Integration tests for the per-project job starter.
//!
//! Shared state is populated directly; the launcher is a recorder.

mod common;

use std::sync::Arc;
use std::time::Duration;

use devicepool_dispatcher::launcher::DryRunLauncher;
use devicepool_dispatcher::shutdown::ShutdownController;
use devicepool_dispatcher::starter::JobStarter;
use devicepool_dispatcher::state::{DeviceMetrics, SharedState};
use devicepool_reconcile::{JobTracker, ManualClock, Suppression};
use tempfile::TempDir;

use common::{ids, project, starter_settings, RecordingLauncher};

const PROJECT: &str = "a55-perf";

fn publish_devices(state: &SharedState, available: &[String]) {
    state.set_device_metrics(
        PROJECT,
        DeviceMetrics {
            active_device_count: available.len(),
            busy_device_count: 0,
            cleanup_device_count: 0,
            total_device_count: available.len(),
            available_device_ids: available.to_vec(),
        },
    );
}

struct Harness {
    starter: JobStarter,
    state: SharedState,
    launcher: Arc<RecordingLauncher>,
    clock: ManualClock,
    work_dir: TempDir,
}

fn harness(device_ids: &[String]) -> Harness {
    let work_dir = tempfile::tempdir().unwrap();
    let state = SharedState::new([PROJECT]);
    let launcher = Arc::new(RecordingLauncher::default());
    let clock = ManualClock::new();
    let tracker = JobTracker::with_clock(Duration::from_secs(210), Arc::new(clock.clone()));

    let owned: Vec<&str> = device_ids.iter().map(String::as_str).collect();
    let starter = JobStarter::with_tracker(
        project(PROJECT, &owned),
        state.clone(),
        launcher.clone(),
        starter_settings(work_dir.path()),
        tracker,
    );

    Harness {
        starter,
        state,
        launcher,
        clock,
        work_dir,
    }
}

fn no_shutdown() -> tokio::sync::watch::Receiver<bool> {
    ShutdownController::new().subscribe()
}

fn job_dir_count(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}

#[tokio::test]
async fn test_starts_one_job_per_pending_task() {
    let devices: Vec<String> = ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect();
    let mut h = harness(&devices);
    h.state.set_pending_task_count(PROJECT, 5);
    publish_devices(&h.state, &devices);

    let report = h.starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.jobs_to_start, 5);
    assert_eq!(report.launched, devices);
    assert!(report.failed.is_empty());
    assert_eq!(h.launcher.launched(), devices);
    assert!(h.launcher.all_manifests_present());
    assert_eq!(h.starter.tracker_mut().active_device_ids(), devices);
    assert_eq!(h.state.global_metrics().session_started_job_count, 5);
    assert_eq!(job_dir_count(&h.work_dir), 5);
}

#[tokio::test]
async fn test_tracked_jobs_cover_pending_demand() {
    let devices = ids("D", 8);
    let mut h = harness(&devices);
    h.state.set_pending_task_count(PROJECT, 3);
    publish_devices(&h.state, &devices);

    let first = h.starter.run_cycle(&no_shutdown()).await;
    assert_eq!(first.launched.len(), 3);

    // The queue still shows the same tasks until the jobs claim them.
    let second = h.starter.run_cycle(&no_shutdown()).await;
    assert_eq!(second.recently_started, 3);
    assert_eq!(second.pending_not_handled, 0);
    assert_eq!(second.jobs_to_start, 0);
    assert_eq!(second.suppression, Some(Suppression::NoDemand));
    assert_eq!(h.launcher.launched().len(), 3);
}

#[tokio::test]
async fn test_claimed_devices_are_not_reused() {
    let devices = ids("D", 4);
    let mut h = harness(&devices);
    h.state.set_pending_task_count(PROJECT, 2);
    publish_devices(&h.state, &devices);

    h.starter.run_cycle(&no_shutdown()).await;

    // More demand arrives; the monitor has not yet seen the devices go busy.
    h.state.set_pending_task_count(PROJECT, 4);
    let report = h.starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.eligible_device_count, 2);
    assert_eq!(report.launched, vec!["D02", "D03"]);
    assert_eq!(h.launcher.launched(), devices);
}

#[tokio::test]
async fn test_launch_failure_skips_device() {
    let devices: Vec<String> = ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect();
    let mut h = harness(&devices);
    h.launcher.fail_on("B");
    h.state.set_pending_task_count(PROJECT, 5);
    publish_devices(&h.state, &devices);

    let report = h.starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.launched, vec!["A", "C", "D", "E"]);
    assert_eq!(report.failed, vec!["B"]);
    assert!(!h.starter.tracker_mut().is_active("B"));
    assert_eq!(h.starter.tracker_mut().active_count(), 4);
    assert_eq!(h.state.global_metrics().session_started_job_count, 4);
    // The failed job's directory is removed.
    assert_eq!(job_dir_count(&h.work_dir), 4);
}

#[tokio::test]
async fn test_failed_device_is_retried_next_cycle() {
    let devices = ids("D", 2);
    let mut h = harness(&devices);
    h.launcher.fail_on("D00");
    h.state.set_pending_task_count(PROJECT, 2);
    publish_devices(&h.state, &devices);

    let first = h.starter.run_cycle(&no_shutdown()).await;
    assert_eq!(first.launched, vec!["D01"]);

    // One task is still uncovered and D00 is still idle.
    let second = h.starter.run_cycle(&no_shutdown()).await;
    assert_eq!(second.pending_not_handled, 1);
    assert_eq!(second.jobs_to_start, 1);
    assert_eq!(second.failed, vec!["D00"]);
}

#[tokio::test]
async fn test_circuit_breaker_blocks_dispatch() {
    let devices = ids("D", 5);
    let mut h = harness(&devices);
    h.state.set_pending_task_count(PROJECT, 5);
    publish_devices(&h.state, &devices);
    h.state.set_initiated_job_count(41);

    let report = h.starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.jobs_to_start, 0);
    assert_eq!(report.suppression, Some(Suppression::CircuitBreaker));
    assert!(h.launcher.launched().is_empty());
    assert_eq!(job_dir_count(&h.work_dir), 0);
}

#[tokio::test]
async fn test_circuit_breaker_threshold_is_inclusive() {
    let devices = ids("D", 5);
    let mut h = harness(&devices);
    h.state.set_pending_task_count(PROJECT, 2);
    publish_devices(&h.state, &devices);
    h.state.set_initiated_job_count(40);

    let report = h.starter.run_cycle(&no_shutdown()).await;
    assert_eq!(report.launched.len(), 2);
}

#[tokio::test]
async fn test_no_eligible_devices_starts_nothing() {
    let devices = ids("D", 3);
    let mut h = harness(&devices);
    h.starter.tracker_mut().record_jobs(devices.iter().cloned());
    h.state.set_pending_task_count(PROJECT, 10);
    publish_devices(&h.state, &devices);

    let report = h.starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.eligible_device_count, 0);
    assert_eq!(report.pending_not_handled, 7);
    assert_eq!(report.jobs_to_start, 0);
    assert_eq!(report.suppression, Some(Suppression::NoDevices));
    assert!(h.launcher.launched().is_empty());
}

#[tokio::test]
async fn test_per_cycle_cap() {
    let devices = ids("D", 15);
    let mut h = harness(&devices);
    h.state.set_pending_task_count(PROJECT, 20);
    publish_devices(&h.state, &devices);

    let report = h.starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.jobs_to_start, 10);
    assert_eq!(report.launched, devices[..10].to_vec());
}

#[tokio::test]
async fn test_expired_dispatches_free_devices() {
    let devices = ids("D", 2);
    let mut h = harness(&devices);
    h.state.set_pending_task_count(PROJECT, 2);
    publish_devices(&h.state, &devices);

    h.starter.run_cycle(&no_shutdown()).await;
    assert_eq!(h.starter.run_cycle(&no_shutdown()).await.jobs_to_start, 0);

    // The jobs never claimed the tasks; after the window they count as lost.
    h.clock.advance(Duration::from_secs(211));
    let report = h.starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.recently_started, 0);
    assert_eq!(report.launched, devices);
    assert_eq!(h.launcher.launched().len(), 4);
}

#[tokio::test]
async fn test_shutdown_mid_batch_records_started_jobs() {
    let devices = ids("D", 5);
    let mut h = harness(&devices);
    let controller = Arc::new(ShutdownController::new());
    h.launcher.shutdown_after_first(controller.clone());
    h.state.set_pending_task_count(PROJECT, 5);
    publish_devices(&h.state, &devices);

    let report = h.starter.run_cycle(&controller.subscribe()).await;

    assert!(report.interrupted);
    assert_eq!(report.launched, vec!["D00"]);
    assert_eq!(h.starter.tracker_mut().active_device_ids(), vec!["D00"]);
}

#[tokio::test]
async fn test_dry_run_does_not_track() {
    let work_dir = tempfile::tempdir().unwrap();
    let devices = ids("D", 2);
    let state = SharedState::new([PROJECT]);
    let launcher = Arc::new(DryRunLauncher::new());
    let mut starter = JobStarter::new(
        project(PROJECT, &["D00", "D01"]),
        state.clone(),
        launcher.clone(),
        starter_settings(work_dir.path()),
    );
    state.set_pending_task_count(PROJECT, 2);
    publish_devices(&state, &devices);

    let report = starter.run_cycle(&no_shutdown()).await;

    assert_eq!(report.launched, devices);
    assert_eq!(launcher.launch_count(), 2);
    assert_eq!(starter.tracker_mut().active_count(), 0);
    assert_eq!(state.global_metrics().session_started_job_count, 2);
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let work_dir = tempfile::tempdir().unwrap();
    let devices = ids("D", 1);
    let state = SharedState::new([PROJECT]);
    let launcher = Arc::new(RecordingLauncher::default());
    let starter = JobStarter::new(
        project(PROJECT, &["D00"]),
        state.clone(),
        launcher.clone(),
        starter_settings(work_dir.path()),
    );
    state.set_pending_task_count(PROJECT, 1);
    publish_devices(&state, &devices);

    let controller = ShutdownController::new();
    let handle = tokio::spawn(starter.run(controller.subscribe()));

    for _ in 0..100 {
        if !launcher.launched().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(launcher.launched(), devices);

    controller.request();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("starter did not stop")
        .unwrap();
}
