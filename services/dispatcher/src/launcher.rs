//! Job launcher interface and implementations.
//!
//! Launching is fire-and-forget: a successful launch means the process was
//! started, nothing more. The job's outcome is never observed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{FarmCredentials, Project};
use crate::error::LaunchError;

/// Label identifying jobs started by this dispatcher.
pub const PROGRAM_LABEL: &str = "tcdp";

/// What the launcher needs to start one job.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub project: &'a Project,
    pub device_id: &'a str,
    pub job_dir: &'a Path,
    pub manifest_path: &'a Path,
}

/// A started job. Carries no completion status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub device_id: String,
    pub pid: Option<u32>,
}

/// Starts job processes.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Start a job and return as soon as the process is running.
    async fn launch(&self, request: &LaunchRequest<'_>) -> Result<Launched, LaunchError>;

    /// Whether launches by this launcher should be recorded as dispatches.
    fn records_dispatch(&self) -> bool {
        true
    }
}

/// Labels passed to the job so farm-side tooling can find it.
pub fn job_labels(project: &str, device_id: &str) -> String {
    format!("{PROGRAM_LABEL},{project},{device_id}")
}

/// Launches jobs with the `hyperexecute` CLI.
pub struct HyperexecuteLauncher {
    binary: PathBuf,
    farm: FarmCredentials,
    binary_check_attempts: u32,
    binary_check_delay: Duration,
    launch_pause: Duration,
}

impl HyperexecuteLauncher {
    /// Create a launcher for `binary`. Relative paths are resolved against
    /// the current directory, since jobs run in their own directory.
    pub fn new(binary: impl Into<PathBuf>, farm: FarmCredentials) -> Self {
        let binary = binary.into();
        let binary = if binary.is_relative() {
            std::env::current_dir()
                .map(|cwd| cwd.join(&binary))
                .unwrap_or(binary)
        } else {
            binary
        };

        Self {
            binary,
            farm,
            binary_check_attempts: 5,
            binary_check_delay: Duration::from_secs(2),
            launch_pause: Duration::from_secs(2),
        }
    }

    /// Override the binary check retry count and delay.
    pub fn with_binary_check(mut self, attempts: u32, delay: Duration) -> Self {
        self.binary_check_attempts = attempts.max(1);
        self.binary_check_delay = delay;
        self
    }

    /// Override the pause after each launch.
    pub fn with_launch_pause(mut self, pause: Duration) -> Self {
        self.launch_pause = pause;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn wait_for_binary(&self) -> Result<(), LaunchError> {
        for attempt in 1..=self.binary_check_attempts {
            if is_executable(&self.binary) {
                return Ok(());
            }
            warn!(
                path = %self.binary.display(),
                attempt,
                max_attempts = self.binary_check_attempts,
                "Launcher binary not found or not executable"
            );
            tokio::time::sleep(self.binary_check_delay).await;
        }

        Err(LaunchError::BinaryMissing {
            path: self.binary.clone(),
            attempts: self.binary_check_attempts,
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl JobLauncher for HyperexecuteLauncher {
    async fn launch(&self, request: &LaunchRequest<'_>) -> Result<Launched, LaunchError> {
        self.wait_for_binary().await?;

        let labels = job_labels(&request.project.name, request.device_id);
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("--no-track")
            .arg("--labels")
            .arg(&labels)
            .arg("--exclude-external-binaries")
            .current_dir(request.job_dir)
            .env("LT_USERNAME", &self.farm.username)
            .env("LT_ACCESS_KEY", &self.farm.access_key)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.binary.display().to_string(),
            source,
        })?;
        let pid = child.id();

        info!(
            project = %request.project.name,
            device_id = request.device_id,
            pid,
            labels = %labels,
            job_dir = %request.job_dir.display(),
            "Launched job"
        );

        // Spread launches out; many jobs starting at once can swamp the
        // device hosts.
        tokio::time::sleep(self.launch_pause).await;

        Ok(Launched {
            device_id: request.device_id.to_string(),
            pid,
        })
    }
}

/// Launcher that renders everything but starts nothing.
pub struct DryRunLauncher {
    launches: AtomicU64,
    pause: Duration,
}

impl DryRunLauncher {
    pub fn new() -> Self {
        Self {
            launches: AtomicU64::new(0),
            pause: Duration::from_millis(100),
        }
    }

    /// Number of launches logged so far.
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Default for DryRunLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobLauncher for DryRunLauncher {
    async fn launch(&self, request: &LaunchRequest<'_>) -> Result<Launched, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        info!(
            project = %request.project.name,
            device_id = request.device_id,
            manifest = %request.manifest_path.display(),
            "[DRY RUN] Would launch job"
        );
        tokio::time::sleep(self.pause).await;
        debug!(device_id = request.device_id, "[DRY RUN] Launch skipped");

        Ok(Launched {
            device_id: request.device_id.to_string(),
            pid: None,
        })
    }

    fn records_dispatch(&self) -> bool {
        false
    }
}
