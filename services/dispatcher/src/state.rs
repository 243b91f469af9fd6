//! Metrics shared between the monitors and the job starters.
//!
//! Monitors are the only writers of [`ProjectMetrics`]; job starters read
//! snapshots. Every write replaces the value for its key as a whole, so a
//! reader never sees half of one monitor pass and half of another. Critical
//! sections never await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Per-project view of demand and capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectMetrics {
    /// Unclaimed tasks for the project's worker type.
    pub pending_task_count: u64,

    pub active_device_count: usize,
    pub busy_device_count: usize,
    pub cleanup_device_count: usize,

    /// Devices the farm reported for this project, in any state.
    pub total_device_count: usize,

    /// Idle devices, in dispatch order.
    pub available_device_ids: Vec<String>,
}

/// Device fields of [`ProjectMetrics`], written together by the device monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMetrics {
    pub active_device_count: usize,
    pub busy_device_count: usize,
    pub cleanup_device_count: usize,
    pub total_device_count: usize,
    pub available_device_ids: Vec<String>,
}

/// Account-wide device counts from one device monitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalDeviceCounts {
    pub active_device_count: usize,
    pub busy_device_count: usize,
    pub cleanup_device_count: usize,
    pub total_device_count: usize,
}

/// Account-wide metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalMetrics {
    /// Jobs the farm reports as initiated but not yet running.
    pub initiated_job_count: u64,

    pub active_device_count: usize,
    pub busy_device_count: usize,
    pub cleanup_device_count: usize,
    pub total_device_count: usize,

    /// Jobs launched by this process since startup.
    pub session_started_job_count: u64,
}

/// Cheaply clonable handle to the shared metrics store.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<SharedStateInner>,
}

#[derive(Default)]
struct SharedStateInner {
    projects: RwLock<HashMap<String, ProjectMetrics>>,
    global: RwLock<GlobalMetrics>,
    session_started: AtomicU64,
}

impl SharedState {
    /// Create a store with an empty entry for each project.
    pub fn new<I, S>(projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projects = projects
            .into_iter()
            .map(|name| (name.into(), ProjectMetrics::default()))
            .collect();
        Self {
            inner: Arc::new(SharedStateInner {
                projects: RwLock::new(projects),
                ..Default::default()
            }),
        }
    }

    /// Replace a project's pending task count.
    pub fn set_pending_task_count(&self, project: &str, count: u64) {
        let mut projects = self
            .inner
            .projects
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        projects.entry(project.to_string()).or_default().pending_task_count = count;
    }

    /// Replace all device fields of a project in one write.
    pub fn set_device_metrics(&self, project: &str, devices: DeviceMetrics) {
        let mut projects = self
            .inner
            .projects
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = projects.entry(project.to_string()).or_default();
        *entry = ProjectMetrics {
            pending_task_count: entry.pending_task_count,
            active_device_count: devices.active_device_count,
            busy_device_count: devices.busy_device_count,
            cleanup_device_count: devices.cleanup_device_count,
            total_device_count: devices.total_device_count,
            available_device_ids: devices.available_device_ids,
        };
    }

    /// Snapshot of one project's metrics.
    pub fn project_metrics(&self, project: &str) -> Option<ProjectMetrics> {
        self.inner
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project)
            .cloned()
    }

    /// Names of all projects with an entry, sorted.
    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Replace the account-wide device counts.
    pub fn set_global_device_counts(&self, counts: GlobalDeviceCounts) {
        let mut global = self
            .inner
            .global
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        global.active_device_count = counts.active_device_count;
        global.busy_device_count = counts.busy_device_count;
        global.cleanup_device_count = counts.cleanup_device_count;
        global.total_device_count = counts.total_device_count;
    }

    /// Replace the account-wide initiated job count.
    pub fn set_initiated_job_count(&self, count: u64) {
        self.inner
            .global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .initiated_job_count = count;
    }

    /// Add to the session-started counter and return the new total.
    pub fn add_started_jobs(&self, count: u64) -> u64 {
        self.inner
            .session_started
            .fetch_add(count, Ordering::Relaxed)
            + count
    }

    /// Snapshot of the account-wide metrics.
    pub fn global_metrics(&self) -> GlobalMetrics {
        let mut global = *self
            .inner
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        global.session_started_job_count = self.inner.session_started.load(Ordering::Relaxed);
        global
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("projects", &self.project_names())
            .field("global", &self.global_metrics())
            .finish()
    }
}
