//! Configuration for the dispatcher.
//!
//! Two layers:
//! - [`Config`]: runtime tuning (intervals, caps, endpoints), read from the
//!   environment with defaults.
//! - [`PoolConfig`]: the project and device-group file, loaded from YAML,
//!   materialized with project defaults and validated once at startup.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use devicepool_reconcile::{AdmissionLimits, DEFAULT_JOB_EXPIRY};
use serde::Deserialize;

use crate::error::ConfigError;

/// Name of the project entry whose values apply to every project.
const DEFAULTS_PROJECT: &str = "defaults";

/// Placeholder secret used when running in CI mode.
const CI_MODE_SECRET: &str = "fake123";

/// Environment lookup used while loading configuration.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read a variable from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the project/device-group YAML file.
    pub config_path: PathBuf,

    /// Interval between queue depth refreshes.
    pub queue_monitor_interval: Duration,

    /// Interval between device list refreshes.
    pub device_monitor_interval: Duration,

    /// Interval between job starter cycles.
    pub job_starter_interval: Duration,

    /// Pause after a cycle that launched jobs, so monitors catch up.
    pub post_launch_settle: Duration,

    /// Delay between starting the monitors and the job starters.
    pub startup_delay: Duration,

    /// Admission caps.
    pub limits: AdmissionLimits,

    /// How long a dispatched device counts as claimed.
    pub job_expiry: Duration,

    /// Taskcluster provisioner owning the worker types.
    pub tc_provisioner: String,

    /// Taskcluster deployment root URL.
    pub tc_root_url: String,

    /// LambdaTest mobile API base URL.
    pub lt_api_url: String,

    /// HyperExecute API base URL.
    pub he_api_url: String,

    /// Path or name of the hyperexecute binary.
    pub hyperexecute_bin: PathBuf,

    /// Root directory for per-job working directories.
    pub work_dir: PathBuf,

    /// Directory copied into each job directory as `user_script`.
    pub user_script_dir: Option<PathBuf>,

    /// Job directories older than this are deleted.
    pub job_dir_max_age: Duration,

    /// Interval between job directory sweeps.
    pub job_dir_clean_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/lambdatest.yml"),
            queue_monitor_interval: Duration::from_secs(30),
            device_monitor_interval: Duration::from_secs(30),
            job_starter_interval: Duration::from_secs(10),
            post_launch_settle: Duration::from_secs(30),
            startup_delay: Duration::from_secs(2),
            limits: AdmissionLimits::default(),
            job_expiry: DEFAULT_JOB_EXPIRY,
            tc_provisioner: "proj-autophone".to_string(),
            tc_root_url: "https://firefox-ci-tc.services.mozilla.com".to_string(),
            lt_api_url: "https://mobile-api.lambdatest.com".to_string(),
            he_api_url: "https://api.hyperexecute.cloud".to_string(),
            hyperexecute_bin: PathBuf::from("hyperexecute"),
            work_dir: std::env::temp_dir(),
            user_script_dir: None,
            job_dir_max_age: Duration::from_secs(86_400),
            job_dir_clean_interval: Duration::from_secs(3_600),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(env: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config_path = env("DEVICEPOOL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_path);

        let queue_monitor_interval = env_secs(
            env,
            "DEVICEPOOL_QUEUE_MONITOR_INTERVAL_SECS",
            defaults.queue_monitor_interval,
        )?;
        let device_monitor_interval = env_secs(
            env,
            "DEVICEPOOL_DEVICE_MONITOR_INTERVAL_SECS",
            defaults.device_monitor_interval,
        )?;
        let job_starter_interval = env_secs(
            env,
            "DEVICEPOOL_JOB_STARTER_INTERVAL_SECS",
            defaults.job_starter_interval,
        )?;
        // The settle pause follows the device monitor unless set explicitly.
        let post_launch_settle = env_secs(
            env,
            "DEVICEPOOL_POST_LAUNCH_SETTLE_SECS",
            device_monitor_interval,
        )?;
        let startup_delay = env_secs(
            env,
            "DEVICEPOOL_STARTUP_DELAY_SECS",
            defaults.startup_delay,
        )?;

        let limits = AdmissionLimits {
            max_per_cycle: env_parse(
                env,
                "DEVICEPOOL_MAX_JOBS_PER_CYCLE",
                defaults.limits.max_per_cycle,
            )?,
            global_max_initiated: env_parse(
                env,
                "DEVICEPOOL_GLOBAL_MAX_INITIATED_JOBS",
                defaults.limits.global_max_initiated,
            )?,
        };

        let job_expiry = env_secs(env, "DEVICEPOOL_JOB_TRACKER_EXPIRY_SECS", defaults.job_expiry)?;

        let tc_provisioner = env("DEVICEPOOL_TC_PROVISIONER").unwrap_or(defaults.tc_provisioner);
        let tc_root_url = env("DEVICEPOOL_TC_ROOT_URL").unwrap_or(defaults.tc_root_url);
        let lt_api_url = env("DEVICEPOOL_LT_API_URL").unwrap_or(defaults.lt_api_url);
        let he_api_url = env("DEVICEPOOL_HE_API_URL").unwrap_or(defaults.he_api_url);

        let hyperexecute_bin = env("DEVICEPOOL_HYPEREXECUTE_BIN")
            .map(PathBuf::from)
            .unwrap_or(defaults.hyperexecute_bin);
        let work_dir = env("DEVICEPOOL_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);
        let user_script_dir = env("DEVICEPOOL_USER_SCRIPT_DIR").map(PathBuf::from);
        let job_dir_max_age = env_secs(
            env,
            "DEVICEPOOL_JOB_DIR_MAX_AGE_SECS",
            defaults.job_dir_max_age,
        )?;
        let job_dir_clean_interval = env_secs(
            env,
            "DEVICEPOOL_JOB_DIR_CLEAN_INTERVAL_SECS",
            defaults.job_dir_clean_interval,
        )?;

        Ok(Self {
            config_path,
            queue_monitor_interval,
            device_monitor_interval,
            job_starter_interval,
            post_launch_settle,
            startup_delay,
            limits,
            job_expiry,
            tc_provisioner,
            tc_root_url,
            lt_api_url,
            he_api_url,
            hyperexecute_bin,
            work_dir,
            user_script_dir,
            job_dir_max_age,
            job_dir_clean_interval,
        })
    }
}

fn env_parse<T: FromStr>(env: EnvLookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn env_secs(env: EnvLookup<'_>, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(env, key, default.as_secs()).map(Duration::from_secs)
}

/// Taskcluster credentials a launched job uses to claim work.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Device farm account credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct FarmCredentials {
    pub username: String,
    pub access_key: String,
}

impl std::fmt::Debug for FarmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmCredentials")
            .field("username", &self.username)
            .field("access_key", &"<redacted>")
            .finish()
    }
}

/// A fully configured project. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub worker_type: String,
    pub device_selector: String,
    pub credentials: Credentials,
    pub device_ids: BTreeSet<String>,
    pub user_scripts_version: Option<String>,
}

impl Project {
    /// Whether a device belongs to this project.
    pub fn owns(&self, device_id: &str) -> bool {
        self.device_ids.contains(device_id)
    }
}

/// Validated project and device-group configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    projects: Vec<Project>,
    unconfigured: Vec<String>,
    farm: FarmCredentials,
    contract_device_count: Option<u64>,
    device_owner: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawPoolFile {
    #[serde(default)]
    global: Option<RawGlobal>,
    projects: BTreeMap<String, Option<RawProject>>,
    #[serde(default)]
    device_groups: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    #[serde(default)]
    contract_device_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProject {
    #[serde(rename = "TC_WORKER_TYPE", default)]
    worker_type: Option<String>,
    #[serde(rename = "TASKCLUSTER_CLIENT_ID", default)]
    client_id: Option<String>,
    #[serde(default)]
    lt_device_selector: Option<String>,
    #[serde(rename = "USER_SCRIPTS_VERSION", default)]
    user_scripts_version: Option<String>,
    #[serde(default)]
    disabled: Option<bool>,
}

impl RawProject {
    fn with_defaults(self, defaults: &RawProject) -> RawProject {
        RawProject {
            worker_type: self.worker_type.or_else(|| defaults.worker_type.clone()),
            client_id: self.client_id.or_else(|| defaults.client_id.clone()),
            lt_device_selector: self
                .lt_device_selector
                .or_else(|| defaults.lt_device_selector.clone()),
            user_scripts_version: self
                .user_scripts_version
                .or_else(|| defaults.user_scripts_version.clone()),
            disabled: self.disabled.or(defaults.disabled),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Environment variable holding a worker type's access token.
pub fn access_token_var(worker_type: &str) -> String {
    worker_type.replace('-', "_")
}

impl PoolConfig {
    /// Load and validate the pool file at `path`.
    pub fn load(path: &Path, env: EnvLookup<'_>, ci_mode: bool) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawPoolFile =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(raw, env, ci_mode)
    }

    /// Parse and validate pool configuration from a YAML string.
    pub fn from_yaml(yaml: &str, env: EnvLookup<'_>, ci_mode: bool) -> Result<Self, ConfigError> {
        let raw: RawPoolFile = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::from_raw(raw, env, ci_mode)
    }

    fn from_raw(raw: RawPoolFile, env: EnvLookup<'_>, ci_mode: bool) -> Result<Self, ConfigError> {
        let RawPoolFile {
            global,
            mut projects,
            device_groups,
        } = raw;

        let defaults = projects
            .remove(DEFAULTS_PROJECT)
            .ok_or(ConfigError::MissingDefaults)?
            .unwrap_or_default();

        // Device groups: space separated ids, null meaning "no devices".
        let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut device_owner: HashMap<String, String> = HashMap::new();
        for (group, ids) in device_groups {
            let ids: BTreeSet<String> = ids
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect();
            for id in &ids {
                if let Some(first) = device_owner.insert(id.clone(), group.clone()) {
                    return Err(ConfigError::DuplicateDevice {
                        device_id: id.clone(),
                        first,
                        second: group,
                    });
                }
            }
            projects.entry(group.clone()).or_insert(None);
            groups.insert(group, ids);
        }

        let mut fully_configured = Vec::new();
        let mut unconfigured = Vec::new();

        for (name, raw_project) in projects {
            let merged = raw_project.unwrap_or_default().with_defaults(&defaults);
            let devices = groups.get(&name).cloned().unwrap_or_default();

            let worker_type = non_empty(merged.worker_type);
            let client_id = non_empty(merged.client_id);
            let disabled = merged.disabled.unwrap_or(false);

            let (Some(worker_type), Some(client_id)) = (worker_type, client_id) else {
                unconfigured.push(name);
                continue;
            };
            if devices.is_empty() || disabled {
                unconfigured.push(name);
                continue;
            }

            let device_selector =
                non_empty(merged.lt_device_selector).ok_or_else(|| ConfigError::MissingField {
                    project: name.clone(),
                    field: "lt_device_selector",
                })?;

            let access_token = if ci_mode {
                CI_MODE_SECRET.to_string()
            } else {
                let var = access_token_var(&worker_type);
                non_empty(env(&var)).ok_or(ConfigError::MissingEnv(var))?
            };

            fully_configured.push(Project {
                name,
                worker_type,
                device_selector,
                credentials: Credentials {
                    client_id,
                    access_token,
                },
                device_ids: devices,
                user_scripts_version: non_empty(merged.user_scripts_version),
            });
        }

        let farm = if ci_mode {
            FarmCredentials {
                username: CI_MODE_SECRET.to_string(),
                access_key: CI_MODE_SECRET.to_string(),
            }
        } else {
            FarmCredentials {
                username: non_empty(env("LT_USERNAME"))
                    .ok_or_else(|| ConfigError::MissingEnv("LT_USERNAME".to_string()))?,
                access_key: non_empty(env("LT_ACCESS_KEY"))
                    .ok_or_else(|| ConfigError::MissingEnv("LT_ACCESS_KEY".to_string()))?,
            }
        };

        let contract_device_count = match global.and_then(|g| g.contract_device_count) {
            Some(count) if count < 0 => {
                return Err(ConfigError::Invalid {
                    key: "global.contract_device_count".to_string(),
                    reason: "must be a non-negative integer".to_string(),
                })
            }
            Some(count) => Some(count as u64),
            None => None,
        };

        Ok(Self {
            projects: fully_configured,
            unconfigured,
            farm,
            contract_device_count,
            device_owner,
        })
    }

    /// Build a pool configuration directly, bypassing file loading.
    pub fn new(projects: Vec<Project>, farm: FarmCredentials) -> Self {
        let device_owner = projects
            .iter()
            .flat_map(|p| p.device_ids.iter().map(|id| (id.clone(), p.name.clone())))
            .collect();
        Self {
            projects,
            unconfigured: Vec::new(),
            farm,
            contract_device_count: None,
            device_owner,
        }
    }

    /// Fully configured projects, sorted by name.
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Look up a fully configured project.
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Projects present in the file that will not run.
    pub fn unconfigured_projects(&self) -> &[String] {
        &self.unconfigured
    }

    pub fn farm_credentials(&self) -> &FarmCredentials {
        &self.farm
    }

    pub fn contract_device_count(&self) -> Option<u64> {
        self.contract_device_count
    }

    /// Project owning a device, across every device group.
    pub fn project_for_device(&self, device_id: &str) -> Option<&str> {
        self.device_owner.get(device_id).map(String::as_str)
    }

    /// Number of devices listed across all device groups.
    pub fn total_device_count(&self) -> usize {
        self.device_owner.len()
    }
}
