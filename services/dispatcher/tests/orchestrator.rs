//! End-to-end tests of the orchestrator with fake collaborators.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devicepool_dispatcher::client::DeviceState::{Active, Busy};
use devicepool_dispatcher::client::{DeviceFarm, DeviceList, JobSummary};
use devicepool_dispatcher::config::{Config, PoolConfig};
use devicepool_dispatcher::error::ClientError;
use devicepool_dispatcher::orchestrator::{Orchestrator, Phase};
use tempfile::TempDir;

use common::{farm_credentials, project, FakeFarm, FakeQueue, RecordingLauncher};

fn fast_config(work_dir: &TempDir) -> Config {
    Config {
        queue_monitor_interval: Duration::from_millis(20),
        device_monitor_interval: Duration::from_millis(20),
        job_starter_interval: Duration::from_millis(20),
        post_launch_settle: Duration::from_secs(3600),
        startup_delay: Duration::from_millis(50),
        work_dir: work_dir.path().to_path_buf(),
        ..Config::default()
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_dispatches_then_shuts_down() {
    let work_dir = tempfile::tempdir().unwrap();
    let pool = PoolConfig::new(
        vec![project("a55", &["A1", "A2", "A3"]), project("s24", &["S1"])],
        farm_credentials(),
    );

    let queue = Arc::new(FakeQueue::default());
    queue.set_count("gecko-t-a55", 2);
    queue.set_count("gecko-t-s24", 0);
    let farm = Arc::new(FakeFarm::with_devices(&[
        ("Galaxy A55", "A1", Active),
        ("Galaxy A55", "A2", Active),
        ("Galaxy A55", "A3", Busy),
        ("Galaxy S24", "S1", Active),
    ]));
    let launcher = Arc::new(RecordingLauncher::default());

    let orchestrator = Orchestrator::new(
        fast_config(&work_dir),
        pool,
        queue.clone(),
        farm.clone(),
        launcher.clone(),
    );
    assert_eq!(orchestrator.phase(), Phase::Starting);

    let mut phases = orchestrator.phase_watch();
    let shutdown = orchestrator.shutdown_handle();
    let state = orchestrator.state();
    let run = tokio::spawn(orchestrator.run());

    tokio::time::timeout(
        Duration::from_secs(5),
        phases.wait_for(|phase| *phase == Phase::Running),
    )
    .await
    .expect("orchestrator never reached running")
    .unwrap();

    assert!(wait_until(|| launcher.launched().len() == 2).await);
    assert_eq!(launcher.launched(), vec!["A1", "A2"]);
    assert_eq!(state.global_metrics().session_started_job_count, 2);
    assert!(queue.calls() > 0);
    assert!(farm.device_calls() > 0);

    shutdown.request();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("orchestrator did not stop")
        .unwrap();

    assert!(summary.stragglers.is_empty());
    assert!(summary.exited_early.is_empty());
    assert_eq!(summary.joined.len(), 5);
    assert!(summary.joined.contains(&"job-dir-cleaner".to_string()));
    assert!(summary.joined.contains(&"job-starter:a55".to_string()));
    assert_eq!(*phases.borrow(), Phase::Stopped);

    // No demand for s24, so nothing launched there.
    assert!(!launcher.launched().contains(&"S1".to_string()));
}

#[tokio::test]
async fn test_shutdown_during_startup_delay() {
    let work_dir = tempfile::tempdir().unwrap();
    let config = Config {
        startup_delay: Duration::from_secs(3600),
        ..fast_config(&work_dir)
    };
    let pool = PoolConfig::new(vec![project("a55", &["A1"])], farm_credentials());
    let queue = Arc::new(FakeQueue::default());
    queue.set_count("gecko-t-a55", 1);
    let farm = Arc::new(FakeFarm::with_devices(&[("Galaxy A55", "A1", Active)]));
    let launcher = Arc::new(RecordingLauncher::default());

    let orchestrator = Orchestrator::new(config, pool, queue, farm, launcher.clone());
    let shutdown = orchestrator.shutdown_handle();
    let run = tokio::spawn(orchestrator.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.on_signal();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("orchestrator did not stop")
        .unwrap();

    assert_eq!(
        summary.joined,
        vec!["queue-monitor", "device-monitor", "job-dir-cleaner"]
    );
    assert!(launcher.launched().is_empty());
}

/// Farm whose device list call panics once it has been called `limit` times.
struct CrashingFarm {
    calls: AtomicUsize,
    limit: usize,
}

#[async_trait]
impl DeviceFarm for CrashingFarm {
    async fn device_list(&self) -> Result<DeviceList, ClientError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            panic!("device list handler crashed");
        }
        Ok(DeviceList::new())
    }

    async fn job_summary(&self) -> Result<JobSummary, ClientError> {
        Ok(JobSummary::new())
    }
}

#[tokio::test]
async fn test_worker_crash_while_running_stops_everything() {
    let work_dir = tempfile::tempdir().unwrap();
    let pool = PoolConfig::new(vec![project("a55", &["A1"])], farm_credentials());
    let queue = Arc::new(FakeQueue::default());
    let farm = Arc::new(CrashingFarm {
        calls: AtomicUsize::new(0),
        limit: 10,
    });
    let launcher = Arc::new(RecordingLauncher::default());

    let orchestrator = Orchestrator::new(fast_config(&work_dir), pool, queue, farm, launcher);
    let mut phases = orchestrator.phase_watch();
    let shutdown = orchestrator.shutdown_handle();
    let run = tokio::spawn(orchestrator.run());

    tokio::time::timeout(
        Duration::from_secs(5),
        phases.wait_for(|phase| *phase == Phase::Running),
    )
    .await
    .expect("orchestrator never reached running")
    .unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("orchestrator kept running after a worker crashed")
        .unwrap();

    assert_eq!(summary.exited_early, vec!["device-monitor"]);
    assert!(!summary.joined.contains(&"device-monitor".to_string()));
    assert!(summary.joined.contains(&"queue-monitor".to_string()));
    assert!(summary.joined.contains(&"job-starter:a55".to_string()));
    assert!(summary.stragglers.is_empty());
    assert!(shutdown.is_shutting_down());
}

#[tokio::test]
async fn test_worker_crash_during_startup_delay() {
    let work_dir = tempfile::tempdir().unwrap();
    let config = Config {
        startup_delay: Duration::from_secs(3600),
        ..fast_config(&work_dir)
    };
    let pool = PoolConfig::new(vec![project("a55", &["A1"])], farm_credentials());
    let farm = Arc::new(CrashingFarm {
        calls: AtomicUsize::new(0),
        limit: 1,
    });
    let launcher = Arc::new(RecordingLauncher::default());

    let orchestrator = Orchestrator::new(
        config,
        pool,
        Arc::new(FakeQueue::default()),
        farm,
        launcher.clone(),
    );
    let summary = tokio::time::timeout(Duration::from_secs(5), orchestrator.run())
        .await
        .expect("orchestrator kept waiting after a worker crashed");

    assert_eq!(summary.exited_early, vec!["device-monitor"]);
    assert_eq!(summary.joined, vec!["queue-monitor", "job-dir-cleaner"]);
    assert!(launcher.launched().is_empty());
}
