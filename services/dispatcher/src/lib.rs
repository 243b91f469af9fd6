//! Device pool dispatcher library.
//!
//! Matches CI queue demand to device farm capacity. Two monitors keep a
//! shared view of queue depth and device state fresh, and one job starter
//! per project launches just enough jobs to cover unmet demand on idle
//! devices.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── QueueMonitor      (pending task counts -> SharedState)
//! ├── DeviceMonitor     (device states, initiated jobs -> SharedState)
//! ├── JobDirCleaner     (old job directories -> removed)
//! └── JobStarter(proj)  (SharedState + JobTracker -> JobLauncher)
//! ```
//!
//! ## Modules
//!
//! - `config`: environment tuning and the project/device-group file
//! - `client`: task queue and device farm API clients
//! - `state`: metrics shared between workers
//! - `monitor`: the two periodic refreshers
//! - `starter`: per-project dispatch
//! - `launcher`: job process launchers
//! - `manifest`: job manifests and working directories
//! - `cleaner`: sweeps old job directories
//! - `shutdown`: signal escalation
//! - `orchestrator`: worker lifecycle

pub mod cleaner;
pub mod client;
pub mod config;
pub mod error;
pub mod launcher;
pub mod manifest;
pub mod monitor;
pub mod orchestrator;
pub mod shutdown;
pub mod starter;
pub mod state;

// Re-export commonly used types
pub use cleaner::JobDirCleaner;
pub use client::{DeviceFarm, DeviceList, DeviceState, JobSummary, TaskQueue};
pub use config::{Config, Credentials, FarmCredentials, PoolConfig, Project};
pub use error::{ClientError, ConfigError, LaunchError};
pub use launcher::{DryRunLauncher, HyperexecuteLauncher, JobLauncher, LaunchRequest, Launched};
pub use orchestrator::{Orchestrator, Phase, RunSummary};
pub use starter::{CycleReport, JobStarter, StarterSettings};
pub use state::{GlobalMetrics, ProjectMetrics, SharedState};
