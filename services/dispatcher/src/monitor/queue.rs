//! Task queue monitor.
//!
//! Polls the CI queue for every fully configured project's worker type and
//! overwrites the project's pending task count. A failed query keeps the
//! previous count.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{shutdown_requested, ticker};
use crate::client::TaskQueue;
use crate::config::Project;
use crate::state::SharedState;

/// Result of one queue monitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePass {
    /// Worker type -> pending count, for queries that succeeded.
    pub counts: BTreeMap<String, u64>,

    /// Projects whose query failed this pass.
    pub failed: Vec<String>,
}

/// Periodic refresher of pending task counts.
pub struct QueueMonitor {
    queue: Arc<dyn TaskQueue>,
    projects: Vec<(String, String)>,
    state: SharedState,
    interval: Duration,
}

impl QueueMonitor {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        projects: &[Project],
        state: SharedState,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            projects: projects
                .iter()
                .map(|p| (p.name.clone(), p.worker_type.clone()))
                .collect(),
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
            "Starting task queue monitor"
        );

        let mut timer = ticker(self.interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.run_once().await;
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Task queue monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Query every project once and update shared state.
    pub async fn run_once(&self) -> QueuePass {
        let mut pass = QueuePass::default();

        for (project, worker_type) in &self.projects {
            match self.queue.pending_task_count(worker_type).await {
                Ok(count) => {
                    self.state.set_pending_task_count(project, count);
                    debug!(project = %project, worker_type = %worker_type, count, "Pending tasks");
                    pass.counts.insert(worker_type.clone(), count);
                }
                Err(e) => {
                    warn!(
                        project = %project,
                        worker_type = %worker_type,
                        error = %e,
                        "Failed to fetch pending task count, keeping previous value"
                    );
                    pass.failed.push(project.clone());
                }
            }
        }

        info!(
            queue_counts = ?pass.counts,
            failed = pass.failed.len(),
            "Task queue summary"
        );
        pass
    }
}
