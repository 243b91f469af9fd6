//! HyperExecute job manifests and per-job working directories.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::Project;
use crate::error::LaunchError;

/// File name the launcher expects in the job directory.
pub const MANIFEST_FILE_NAME: &str = "hyperexecute.yaml";

/// Subdirectory of the job directory holding the helper scripts.
pub const USER_SCRIPT_DIR_NAME: &str = "user_script";

/// Prefix of every job directory name.
pub const JOB_DIR_PREFIX: &str = "devicepool-job";

/// App installed on the device. The worker drives tests itself, so this is
/// a fixed placeholder the farm requires.
const PLACEHOLDER_APP_ID: &str = "lt://proverbial-android";

/// A HyperExecute job definition for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub version: String,
    pub autosplit: bool,
    pub runson: String,
    pub concurrency: u32,
    pub test_discovery: TestDiscovery,
    pub env: BTreeMap<String, String>,
    pub test_runner_command: String,
    pub framework_status_only: bool,
    pub dynamic_allocation: bool,
    pub shell: String,
    pub pre: Vec<String>,
    pub post: Vec<String>,
    pub differential_upload: DifferentialUpload,
    pub framework: Framework,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestDiscovery {
    pub command: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialUpload {
    pub enabled: bool,
    pub ttl_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Framework {
    pub name: String,
    pub args: FrameworkArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkArgs {
    /// Device selector; the farm picks a device of this type.
    pub devices: Vec<String>,
    /// Pin the job to one device.
    pub udid: String,
    pub video: bool,
    pub device_logs: bool,
    pub app_id: String,
    pub build_name: String,
    pub private_cloud: bool,
    pub queue_timeout: u32,
    pub region: String,
    pub disable_release_device: bool,
    pub is_real_mobile: bool,
    pub reservation: bool,
    pub platform_name: String,
}

impl JobManifest {
    /// Manifest running one generic-worker session for `project` on `device_id`.
    pub fn for_device(project: &Project, device_id: &str) -> Self {
        let env = BTreeMap::from([
            (
                "TASKCLUSTER_CLIENT_ID".to_string(),
                project.credentials.client_id.clone(),
            ),
            (
                "TASKCLUSTER_ACCESS_TOKEN".to_string(),
                project.credentials.access_token.clone(),
            ),
            ("TC_WORKER_TYPE".to_string(), project.worker_type.clone()),
        ]);

        Self {
            version: "0.2".to_string(),
            autosplit: true,
            runson: "android".to_string(),
            concurrency: 1,
            test_discovery: TestDiscovery {
                command: "echo \"taskcluster generic-worker 0\"".to_string(),
                mode: "static".to_string(),
                kind: "raw".to_string(),
            },
            env,
            test_runner_command: "python3 /home/ltuser/taskcluster/run_gw.py".to_string(),
            framework_status_only: true,
            dynamic_allocation: true,
            shell: "bash".to_string(),
            pre: vec![
                "pip3 install mozdevice".to_string(),
                format!("bash ./{USER_SCRIPT_DIR_NAME}/setup_script.sh"),
            ],
            post: vec![format!("python3 ./{USER_SCRIPT_DIR_NAME}/reboot_and_wait.py")],
            differential_upload: DifferentialUpload {
                enabled: true,
                ttl_hours: 360,
            },
            framework: Framework {
                name: "raw".to_string(),
                args: FrameworkArgs {
                    devices: vec![project.device_selector.clone()],
                    udid: device_id.to_string(),
                    video: true,
                    device_logs: true,
                    app_id: PLACEHOLDER_APP_ID.to_string(),
                    build_name: "geckoview_example.apk".to_string(),
                    private_cloud: true,
                    queue_timeout: 600,
                    region: "us".to_string(),
                    disable_release_device: true,
                    is_real_mobile: true,
                    reservation: false,
                    platform_name: "android".to_string(),
                },
            },
        }
    }

    /// Serialize to YAML.
    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// A unique working directory for one launched job.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: PathBuf,
}

impl JobWorkspace {
    /// Create `<root>/devicepool-job.<project>.<ULID>`, copying `user_scripts`
    /// into it when given.
    pub fn create(
        root: &Path,
        project: &str,
        user_scripts: Option<&Path>,
    ) -> Result<Self, LaunchError> {
        let dir = root.join(format!("{JOB_DIR_PREFIX}.{project}.{}", Ulid::new()));
        fs::create_dir_all(&dir).map_err(|source| LaunchError::Workspace {
            path: dir.clone(),
            source,
        })?;
        let workspace = Self { dir };

        if let Some(source_dir) = user_scripts {
            let target = workspace.dir.join(USER_SCRIPT_DIR_NAME);
            if let Err(source) = copy_dir(source_dir, &target) {
                workspace.remove();
                return Err(LaunchError::Workspace {
                    path: target,
                    source,
                });
            }
        }

        debug!(path = %workspace.dir.display(), "Created job directory");
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Render `manifest` into the workspace and return the file path.
    pub fn write_manifest(&self, manifest: &JobManifest) -> Result<PathBuf, LaunchError> {
        let path = self.dir.join(MANIFEST_FILE_NAME);
        let yaml = manifest.render()?;
        fs::write(&path, yaml).map_err(|source| LaunchError::Workspace {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Delete the directory. Failures are logged, not returned.
    pub fn remove(self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(path = %self.dir.display(), error = %e, "Failed to remove job directory");
        }
    }

    /// Give up ownership of the directory, leaving it on disk.
    pub fn keep(self) -> PathBuf {
        self.dir
    }

    /// Delete job directories directly under `root` last modified more than
    /// `max_age` ago. Entries that do not carry the job directory prefix are
    /// left alone. Returns the removed paths.
    pub fn prune_older_than(root: &Path, max_age: Duration) -> io::Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for entry in fs::read_dir(root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "Failed to read work dir entry");
                    continue;
                }
            };
            if !is_job_dir_name(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let path = entry.path();
            // Symlinks are not followed.
            let modified = match entry.metadata() {
                Ok(metadata) if metadata.is_dir() => metadata.modified(),
                Ok(_) => continue,
                Err(e) => Err(e),
            };
            let age = match modified {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read job directory age");
                    continue;
                }
            };
            if age <= max_age {
                continue;
            }

            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Removed old job directory");
                    removed.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove old job directory");
                }
            }
        }

        Ok(removed)
    }
}

fn is_job_dir_name(name: &str) -> bool {
    name.strip_prefix(JOB_DIR_PREFIX)
        .is_some_and(|rest| rest.starts_with('.'))
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
