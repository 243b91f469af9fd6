//! Device pool monitor.
//!
//! One device list fetch per pass. Every device is classified, each fully
//! configured project gets its device fields replaced from the same snapshot,
//! and the account-wide counters are refreshed alongside. When the fetch
//! fails nothing is written and the previous values stay in place.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{shutdown_requested, ticker};
use crate::client::{DeviceFarm, DeviceList, DeviceState};
use crate::config::Project;
use crate::error::ClientError;
use crate::state::{DeviceMetrics, GlobalDeviceCounts, SharedState};

/// Job state counted against the circuit breaker.
const INITIATED_JOB_STATE: &str = "initiated";

/// Periodic refresher of device metrics.
pub struct DeviceMonitor {
    farm: Arc<dyn DeviceFarm>,
    projects: Vec<(String, BTreeSet<String>)>,
    configured_device_count: usize,
    state: SharedState,
    interval: Duration,
}

impl DeviceMonitor {
    /// `configured_device_count` is the number of devices across all device
    /// groups, used as the utilization denominator.
    pub fn new(
        farm: Arc<dyn DeviceFarm>,
        projects: &[Project],
        configured_device_count: usize,
        state: SharedState,
        interval: Duration,
    ) -> Self {
        Self {
            farm,
            projects: projects
                .iter()
                .map(|p| (p.name.clone(), p.device_ids.clone()))
                .collect(),
            configured_device_count,
            state,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until shutdown. The first pass runs immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            projects = self.projects.len(),
            configured_devices = self.configured_device_count,
            "Starting device pool monitor"
        );

        let mut timer = ticker(self.interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Device pool refresh failed, keeping previous values");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Device pool monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Fetch the farm state once and update shared state.
    pub async fn run_once(&self) -> Result<GlobalDeviceCounts, ClientError> {
        let list = self.farm.device_list().await?;
        let by_device = flatten(&list);

        let mut project_active = BTreeMap::new();
        for (project, owned) in &self.projects {
            let metrics = project_device_metrics(&by_device, owned);
            project_active.insert(project.clone(), metrics.active_device_count);
            debug!(
                project = %project,
                active = metrics.active_device_count,
                busy = metrics.busy_device_count,
                cleanup = metrics.cleanup_device_count,
                reported = metrics.total_device_count,
                "Project devices"
            );
            self.state.set_device_metrics(project, metrics);
        }

        let counts = global_counts(&by_device);
        self.state.set_global_device_counts(counts);

        match self.farm.job_summary().await {
            Ok(summary) => {
                let initiated = summary.get(INITIATED_JOB_STATE).copied().unwrap_or(0);
                self.state.set_initiated_job_count(initiated);
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch job summary, keeping previous initiated count");
            }
        }

        let global = self.state.global_metrics();
        info!(
            total = self.configured_device_count,
            reported = counts.total_device_count,
            active = counts.active_device_count,
            busy = counts.busy_device_count,
            cleanup = counts.cleanup_device_count,
            busy_pct = busy_percentage(counts.busy_device_count, self.configured_device_count),
            initiated_jobs = global.initiated_job_count,
            session_started_jobs = global.session_started_job_count,
            project_active = ?project_active,
            "Device utilization summary"
        );

        Ok(counts)
    }
}

/// Device id -> state, in device type then id order. A udid listed under
/// more than one device type keeps its first entry.
fn flatten(list: &DeviceList) -> Vec<(&str, DeviceState)> {
    let mut seen = BTreeSet::new();
    list.values()
        .flat_map(|devices| devices.iter())
        .filter(|&(id, _)| seen.insert(id.as_str()))
        .map(|(id, state)| (id.as_str(), *state))
        .collect()
}

fn project_device_metrics(devices: &[(&str, DeviceState)], owned: &BTreeSet<String>) -> DeviceMetrics {
    let mut metrics = DeviceMetrics::default();
    for (id, state) in devices.iter().filter(|(id, _)| owned.contains(*id)) {
        metrics.total_device_count += 1;
        match state {
            DeviceState::Active => {
                metrics.active_device_count += 1;
                metrics.available_device_ids.push(id.to_string());
            }
            DeviceState::Busy => metrics.busy_device_count += 1,
            DeviceState::Cleanup => metrics.cleanup_device_count += 1,
            DeviceState::Initiated | DeviceState::Unknown => {}
        }
    }
    metrics
}

fn global_counts(devices: &[(&str, DeviceState)]) -> GlobalDeviceCounts {
    let mut counts = GlobalDeviceCounts {
        total_device_count: devices.len(),
        ..Default::default()
    };
    for (_, state) in devices {
        match state {
            DeviceState::Active => counts.active_device_count += 1,
            DeviceState::Busy => counts.busy_device_count += 1,
            DeviceState::Cleanup => counts.cleanup_device_count += 1,
            DeviceState::Initiated | DeviceState::Unknown => {}
        }
    }
    counts
}

fn busy_percentage(busy: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = busy as f64 / total as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}
