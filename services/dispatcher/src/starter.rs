//! Per-project job starter.
//!
//! Each cycle the starter reads its project's metrics, subtracts the
//! devices and demand already covered by recently dispatched jobs, asks the
//! admission calculator how many jobs to start, and launches them on the
//! first eligible devices. It is the only writer of its [`JobTracker`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devicepool_reconcile::{AdmissionLimits, JobTracker, Suppression};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Project};
use crate::error::LaunchError;
use crate::launcher::{JobLauncher, LaunchRequest, Launched};
use crate::manifest::{JobManifest, JobWorkspace};
use crate::monitor::shutdown_requested;
use crate::state::SharedState;

/// Job starter tuning.
#[derive(Debug, Clone)]
pub struct StarterSettings {
    pub limits: AdmissionLimits,
    pub interval: Duration,
    /// Extra wait after a cycle that launched jobs.
    pub post_launch_settle: Duration,
    pub job_expiry: Duration,
    pub work_dir: PathBuf,
    pub user_script_dir: Option<PathBuf>,
}

impl StarterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits,
            interval: config.job_starter_interval,
            post_launch_settle: config.post_launch_settle,
            job_expiry: config.job_expiry,
            work_dir: config.work_dir.clone(),
            user_script_dir: config.user_script_dir.clone(),
        }
    }
}

/// Outcome of one starter cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pending_task_count: u64,
    pub recently_started: usize,
    pub pending_not_handled: i64,
    pub eligible_device_count: usize,
    pub jobs_to_start: usize,
    /// Devices a job was launched on, in launch order.
    pub launched: Vec<String>,
    /// Devices whose launch failed.
    pub failed: Vec<String>,
    pub suppression: Option<Suppression>,
    /// Shutdown was observed before every planned launch was attempted.
    pub interrupted: bool,
}

/// Dispatches jobs for one project.
pub struct JobStarter {
    project: Project,
    state: SharedState,
    launcher: Arc<dyn JobLauncher>,
    tracker: JobTracker,
    settings: StarterSettings,
}

impl JobStarter {
    pub fn new(
        project: Project,
        state: SharedState,
        launcher: Arc<dyn JobLauncher>,
        settings: StarterSettings,
    ) -> Self {
        let tracker = JobTracker::new(settings.job_expiry);
        Self::with_tracker(project, state, launcher, settings, tracker)
    }

    /// Create a starter with a pre-built tracker.
    pub fn with_tracker(
        project: Project,
        state: SharedState,
        launcher: Arc<dyn JobLauncher>,
        settings: StarterSettings,
        tracker: JobTracker,
    ) -> Self {
        Self {
            project,
            state,
            launcher,
            tracker,
            settings,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn interval(&self) -> Duration {
        self.settings.interval
    }

    pub fn tracker_mut(&mut self) -> &mut JobTracker {
        &mut self.tracker
    }

    /// Run cycles until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            project = %self.project.name,
            interval_secs = self.settings.interval.as_secs(),
            devices = self.project.device_ids.len(),
            "Starting job starter"
        );

        loop {
            let report = self.run_cycle(&shutdown).await;
            if report.interrupted {
                break;
            }

            let mut wait = self.settings.interval;
            if !report.launched.is_empty() {
                wait += self.settings.post_launch_settle;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!(project = %self.project.name, "Job starter shutting down");
    }

    /// Run a single dispatch cycle.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let project_name = self.project.name.clone();
        let metrics = self.state.project_metrics(&project_name).unwrap_or_default();
        let global = self.state.global_metrics();

        let recently_started = self.tracker.active_count();
        let claimed = self.tracker.active_device_ids();

        let eligible: Vec<String> = metrics
            .available_device_ids
            .iter()
            .filter(|id| !claimed.contains(id))
            .cloned()
            .collect();

        if metrics.active_device_count != metrics.available_device_ids.len() {
            warn!(
                project = %project_name,
                active_device_count = metrics.active_device_count,
                available_list_len = metrics.available_device_ids.len(),
                "Active device count and available device list disagree"
            );
        }

        let pending_not_handled = metrics.pending_task_count as i64 - recently_started as i64;
        let limits = self.settings.limits;
        let jobs_to_start = limits.jobs_to_start(
            pending_not_handled,
            eligible.len(),
            global.initiated_job_count,
        );

        info!(
            project = %project_name,
            pending = metrics.pending_task_count,
            active = metrics.active_device_count,
            busy = metrics.busy_device_count,
            cleanup = metrics.cleanup_device_count,
            recently_started,
            not_handled = pending_not_handled,
            eligible = eligible.len(),
            to_start = jobs_to_start,
            global_initiated = global.initiated_job_count,
            global_initiated_cap = limits.global_max_initiated,
            "Dispatch summary"
        );

        let mut report = CycleReport {
            pending_task_count: metrics.pending_task_count,
            recently_started,
            pending_not_handled,
            eligible_device_count: eligible.len(),
            jobs_to_start,
            ..Default::default()
        };

        if jobs_to_start == 0 {
            report.suppression =
                limits.suppression(pending_not_handled, eligible.len(), global.initiated_job_count);
            if let Some(reason) = report.suppression {
                debug!(project = %project_name, reason = %reason, "Not starting jobs");
            }
            return report;
        }

        let mut devices = eligible.into_iter();
        for n in 0..jobs_to_start {
            if *shutdown.borrow() {
                info!(project = %project_name, "Shutdown requested during job launches");
                report.interrupted = true;
                break;
            }

            let Some(device_id) = devices.next() else {
                warn!(
                    project = %project_name,
                    planned = jobs_to_start,
                    attempted = n,
                    "Ran out of devices before starting every planned job"
                );
                break;
            };

            match self.launch_one(&device_id).await {
                Ok(launched) => report.launched.push(launched.device_id),
                Err(e) => {
                    error!(
                        project = %project_name,
                        device_id = %device_id,
                        error = %e,
                        "Failed to start job"
                    );
                    report.failed.push(device_id);
                }
            }
        }

        if !report.launched.is_empty() {
            if self.launcher.records_dispatch() {
                self.tracker.record_jobs(report.launched.iter().cloned());
            }
            let session_total = self.state.add_started_jobs(report.launched.len() as u64);
            info!(
                project = %project_name,
                count = report.launched.len(),
                devices = ?report.launched,
                session_started_jobs = session_total,
                dry_run = !self.launcher.records_dispatch(),
                "Started jobs"
            );
        }

        report
    }

    async fn launch_one(&self, device_id: &str) -> Result<Launched, LaunchError> {
        let user_scripts = self.user_script_source();
        let workspace = JobWorkspace::create(
            &self.settings.work_dir,
            &self.project.name,
            user_scripts.as_deref(),
        )?;

        let manifest = JobManifest::for_device(&self.project, device_id);
        let manifest_path = match workspace.write_manifest(&manifest) {
            Ok(path) => path,
            Err(e) => {
                workspace.remove();
                return Err(e);
            }
        };

        let request = LaunchRequest {
            project: &self.project,
            device_id,
            job_dir: workspace.path(),
            manifest_path: &manifest_path,
        };

        match self.launcher.launch(&request).await {
            Ok(launched) => {
                workspace.keep();
                Ok(launched)
            }
            Err(e) => {
                workspace.remove();
                Err(e)
            }
        }
    }

    fn user_script_source(&self) -> Option<PathBuf> {
        let base = self.settings.user_script_dir.as_ref()?;
        Some(match &self.project.user_scripts_version {
            Some(version) => base.join(version),
            None => base.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use std::collections::BTreeSet;

    fn settings(user_script_dir: Option<PathBuf>) -> StarterSettings {
        StarterSettings {
            limits: AdmissionLimits::default(),
            interval: Duration::from_secs(10),
            post_launch_settle: Duration::from_secs(30),
            job_expiry: Duration::from_secs(210),
            work_dir: std::env::temp_dir(),
            user_script_dir,
        }
    }

    fn project(version: Option<&str>) -> Project {
        Project {
            name: "p".to_string(),
            worker_type: "wt".to_string(),
            device_selector: "sel".to_string(),
            credentials: Credentials {
                client_id: "c".to_string(),
                access_token: "t".to_string(),
            },
            device_ids: BTreeSet::new(),
            user_scripts_version: version.map(str::to_string),
        }
    }

    #[test]
    fn test_user_script_source() {
        let launcher = Arc::new(crate::launcher::DryRunLauncher::new());
        let state = SharedState::new(["p"]);

        let starter = JobStarter::new(project(None), state.clone(), launcher.clone(), settings(None));
        assert_eq!(starter.user_script_source(), None);

        let starter = JobStarter::new(
            project(None),
            state.clone(),
            launcher.clone(),
            settings(Some(PathBuf::from("/scripts"))),
        );
        assert_eq!(starter.user_script_source(), Some(PathBuf::from("/scripts")));

        let starter = JobStarter::new(
            project(Some("v3")),
            state,
            launcher,
            settings(Some(PathBuf::from("/scripts"))),
        );
        assert_eq!(starter.user_script_source(), Some(PathBuf::from("/scripts/v3")));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::default();
        let settings = StarterSettings::from_config(&config);
        assert_eq!(settings.interval, Duration::from_secs(10));
        assert_eq!(settings.post_launch_settle, Duration::from_secs(30));
        assert_eq!(settings.limits, AdmissionLimits::default());
    }
}
