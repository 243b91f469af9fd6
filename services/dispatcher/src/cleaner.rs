//! Periodic removal of old job directories.
//!
//! Every successful launch leaves its job directory behind for the running
//! job. The cleaner sweeps the work dir and deletes job directories whose
//! last modification is older than the configured age.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::manifest::JobWorkspace;
use crate::monitor::{shutdown_requested, ticker};

/// Sweeps old job directories on an interval.
pub struct JobDirCleaner {
    root: PathBuf,
    max_age: Duration,
    interval: Duration,
}

impl JobDirCleaner {
    pub fn new(root: PathBuf, max_age: Duration, interval: Duration) -> Self {
        Self {
            root,
            max_age,
            interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.work_dir.clone(),
            config.job_dir_max_age,
            config.job_dir_clean_interval,
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until shutdown. The first sweep runs immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            root = %self.root.display(),
            max_age_secs = self.max_age.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting job directory cleaner"
        );

        let mut timer = ticker(self.interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.run_once().await;
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Job directory cleaner shutting down");
                    break;
                }
            }
        }
    }

    /// Sweep once and return the removed directories.
    pub async fn run_once(&self) -> Vec<PathBuf> {
        let root = self.root.clone();
        let max_age = self.max_age;
        let result =
            tokio::task::spawn_blocking(move || JobWorkspace::prune_older_than(&root, max_age))
                .await;

        match result {
            Ok(Ok(removed)) => {
                if removed.is_empty() {
                    debug!(root = %self.root.display(), "No old job directories");
                } else {
                    info!(
                        root = %self.root.display(),
                        removed = removed.len(),
                        "Removed old job directories"
                    );
                }
                removed
            }
            Ok(Err(e)) => {
                error!(root = %self.root.display(), error = %e, "Failed to scan work dir");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "Job directory sweep task failed");
                Vec::new()
            }
        }
    }
}
