//! Shared fakes for dispatcher integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devicepool_dispatcher::client::{DeviceFarm, DeviceList, DeviceState, JobSummary, TaskQueue};
use devicepool_dispatcher::config::{Credentials, FarmCredentials, Project};
use devicepool_dispatcher::error::{ClientError, LaunchError};
use devicepool_dispatcher::launcher::{JobLauncher, LaunchRequest, Launched};
use devicepool_dispatcher::shutdown::ShutdownController;
use devicepool_dispatcher::starter::StarterSettings;
use devicepool_reconcile::AdmissionLimits;

pub fn unavailable(url: &str) -> ClientError {
    ClientError::Status {
        url: url.to_string(),
        status: 503,
        body: "unavailable".to_string(),
    }
}

pub fn project(name: &str, device_ids: &[&str]) -> Project {
    Project {
        name: name.to_string(),
        worker_type: format!("gecko-t-{name}"),
        device_selector: "Galaxy A55 5G-14".to_string(),
        credentials: Credentials {
            client_id: format!("project/autophone/{name}"),
            access_token: "secret".to_string(),
        },
        device_ids: device_ids.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        user_scripts_version: None,
    }
}

pub fn farm_credentials() -> FarmCredentials {
    FarmCredentials {
        username: "user".to_string(),
        access_key: "key".to_string(),
    }
}

pub fn starter_settings(work_dir: &Path) -> StarterSettings {
    StarterSettings {
        limits: AdmissionLimits::default(),
        interval: Duration::from_millis(20),
        post_launch_settle: Duration::from_millis(20),
        job_expiry: Duration::from_secs(210),
        work_dir: work_dir.to_path_buf(),
        user_script_dir: None,
    }
}

pub fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i:02}")).collect()
}

/// Task queue with scripted per-worker-type answers.
#[derive(Default)]
pub struct FakeQueue {
    counts: Mutex<HashMap<String, u64>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeQueue {
    pub fn set_count(&self, worker_type: &str, count: u64) {
        self.counts
            .lock()
            .unwrap()
            .insert(worker_type.to_string(), count);
        self.failing.lock().unwrap().remove(worker_type);
    }

    pub fn set_failing(&self, worker_type: &str) {
        self.failing.lock().unwrap().insert(worker_type.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for FakeQueue {
    async fn pending_task_count(&self, worker_type: &str) -> Result<u64, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(worker_type) {
            return Err(unavailable("fake://queue"));
        }
        Ok(self
            .counts
            .lock()
            .unwrap()
            .get(worker_type)
            .copied()
            .unwrap_or(0))
    }
}

/// Device farm with a scripted device list and job summary.
///
/// `None` makes the corresponding call fail.
#[derive(Default)]
pub struct FakeFarm {
    devices: Mutex<Option<DeviceList>>,
    jobs: Mutex<Option<JobSummary>>,
    device_calls: AtomicUsize,
}

impl FakeFarm {
    pub fn with_devices(devices: &[(&str, &str, DeviceState)]) -> Self {
        let farm = Self::default();
        farm.set_devices(devices);
        farm.set_initiated(0);
        farm
    }

    /// Replace the device list with `(device_type, udid, state)` entries.
    pub fn set_devices(&self, devices: &[(&str, &str, DeviceState)]) {
        let mut list = DeviceList::new();
        for (kind, udid, state) in devices {
            list.entry(kind.to_string())
                .or_default()
                .insert(udid.to_string(), *state);
        }
        *self.devices.lock().unwrap() = Some(list);
    }

    pub fn fail_devices(&self) {
        *self.devices.lock().unwrap() = None;
    }

    pub fn set_initiated(&self, count: u64) {
        *self.jobs.lock().unwrap() = Some(BTreeMap::from([
            ("initiated".to_string(), count),
            ("running".to_string(), 3),
        ]));
    }

    pub fn fail_jobs(&self) {
        *self.jobs.lock().unwrap() = None;
    }

    pub fn device_calls(&self) -> usize {
        self.device_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceFarm for FakeFarm {
    async fn device_list(&self) -> Result<DeviceList, ClientError> {
        self.device_calls.fetch_add(1, Ordering::SeqCst);
        self.devices
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| unavailable("fake://devices"))
    }

    async fn job_summary(&self) -> Result<JobSummary, ClientError> {
        self.jobs
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| unavailable("fake://jobs"))
    }
}

/// Launcher that records launches instead of spawning processes.
#[derive(Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<String>>,
    manifests_seen: Mutex<Vec<bool>>,
    fail_devices: Mutex<HashSet<String>>,
    shutdown_after_first: Mutex<Option<Arc<ShutdownController>>>,
}

impl RecordingLauncher {
    pub fn fail_on(&self, device_id: &str) {
        self.fail_devices
            .lock()
            .unwrap()
            .insert(device_id.to_string());
    }

    /// Request shutdown right after the first launch.
    pub fn shutdown_after_first(&self, controller: Arc<ShutdownController>) {
        *self.shutdown_after_first.lock().unwrap() = Some(controller);
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    /// Whether every launch found its manifest on disk.
    pub fn all_manifests_present(&self) -> bool {
        self.manifests_seen.lock().unwrap().iter().all(|seen| *seen)
    }
}

#[async_trait]
impl JobLauncher for RecordingLauncher {
    async fn launch(&self, request: &LaunchRequest<'_>) -> Result<Launched, LaunchError> {
        self.manifests_seen
            .lock()
            .unwrap()
            .push(request.manifest_path.is_file());

        if self.fail_devices.lock().unwrap().contains(request.device_id) {
            return Err(LaunchError::Spawn {
                program: "fake".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "spawn refused"),
            });
        }

        self.launched
            .lock()
            .unwrap()
            .push(request.device_id.to_string());

        if let Some(controller) = self.shutdown_after_first.lock().unwrap().take() {
            controller.request();
        }

        Ok(Launched {
            device_id: request.device_id.to_string(),
            pid: Some(4242),
        })
    }
}
