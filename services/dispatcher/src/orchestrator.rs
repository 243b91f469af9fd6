//! Worker supervision.
//!
//! The orchestrator starts both monitors, gives them a moment to fetch the
//! first data, then starts one job starter per fully configured project. A
//! worker that stops on its own before shutdown is logged and triggers a
//! shutdown of the rest. On shutdown it waits for every worker with a bounded
//! timeout and reports the ones that did not stop in time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::cleaner::JobDirCleaner;
use crate::client::{DeviceFarm, TaskQueue};
use crate::config::{Config, PoolConfig};
use crate::launcher::JobLauncher;
use crate::monitor::{shutdown_requested, DeviceMonitor, QueueMonitor};
use crate::shutdown::ShutdownController;
use crate::starter::{JobStarter, StarterSettings};
use crate::state::SharedState;

/// Extra join time for monitors beyond their interval.
const MONITOR_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Extra join time for job starters beyond their interval.
const STARTER_JOIN_GRACE: Duration = Duration::from_secs(10);

/// Join time for the job directory cleaner, which may be mid-sweep.
const CLEANER_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Workers that joined in time.
    pub joined: Vec<String>,
    /// Workers that missed their join deadline and were aborted.
    pub stragglers: Vec<String>,
    /// Workers that stopped on their own before shutdown was requested.
    pub exited_early: Vec<String>,
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    join_timeout: Duration,
}

/// Wires the workers together and supervises their lifecycle.
pub struct Orchestrator {
    config: Config,
    pool: PoolConfig,
    queue: Arc<dyn TaskQueue>,
    farm: Arc<dyn DeviceFarm>,
    launcher: Arc<dyn JobLauncher>,
    state: SharedState,
    shutdown: Arc<ShutdownController>,
    phase: watch::Sender<Phase>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        pool: PoolConfig,
        queue: Arc<dyn TaskQueue>,
        farm: Arc<dyn DeviceFarm>,
        launcher: Arc<dyn JobLauncher>,
    ) -> Self {
        let state = SharedState::new(pool.projects().iter().map(|p| p.name.clone()));
        let (phase, _) = watch::channel(Phase::Starting);
        Self {
            config,
            pool,
            queue,
            farm,
            launcher,
            state,
            shutdown: Arc::new(ShutdownController::new()),
            phase,
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Handle used to request shutdown, from a signal listener or a test.
    pub fn shutdown_handle(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        info!(from = %previous, to = %phase, "Orchestrator phase change");
    }

    /// Run every worker until shutdown is requested, then join them.
    pub async fn run(self) -> RunSummary {
        self.set_phase(Phase::Starting);
        let mut shutdown = self.shutdown.subscribe();
        let mut workers = Vec::new();

        let queue_monitor = QueueMonitor::new(
            Arc::clone(&self.queue),
            self.pool.projects(),
            self.state.clone(),
            self.config.queue_monitor_interval,
        );
        workers.push(Worker {
            name: "queue-monitor".to_string(),
            join_timeout: queue_monitor.interval() + MONITOR_JOIN_GRACE,
            handle: tokio::spawn({
                let shutdown = self.shutdown.subscribe();
                async move { queue_monitor.run(shutdown).await }
            }),
        });

        let device_monitor = DeviceMonitor::new(
            Arc::clone(&self.farm),
            self.pool.projects(),
            self.pool.total_device_count(),
            self.state.clone(),
            self.config.device_monitor_interval,
        );
        workers.push(Worker {
            name: "device-monitor".to_string(),
            join_timeout: device_monitor.interval() + MONITOR_JOIN_GRACE,
            handle: tokio::spawn({
                let shutdown = self.shutdown.subscribe();
                async move { device_monitor.run(shutdown).await }
            }),
        });

        let cleaner = JobDirCleaner::from_config(&self.config);
        workers.push(Worker {
            name: "job-dir-cleaner".to_string(),
            join_timeout: CLEANER_JOIN_TIMEOUT,
            handle: tokio::spawn({
                let shutdown = self.shutdown.subscribe();
                async move { cleaner.run(shutdown).await }
            }),
        });

        let mut exited_early = Vec::new();

        // Let the monitors populate shared state before dispatching.
        let startup_completed = tokio::select! {
            _ = tokio::time::sleep(self.config.startup_delay) => true,
            exited = self.wait_for_stop(&mut shutdown, &mut workers) => {
                exited_early.extend(exited);
                false
            }
        };

        if startup_completed {
            let settings = StarterSettings::from_config(&self.config);
            for project in self.pool.projects() {
                let starter = JobStarter::new(
                    project.clone(),
                    self.state.clone(),
                    Arc::clone(&self.launcher),
                    settings.clone(),
                );
                workers.push(Worker {
                    name: format!("job-starter:{}", project.name),
                    join_timeout: starter.interval() + STARTER_JOIN_GRACE,
                    handle: tokio::spawn({
                        let shutdown = self.shutdown.subscribe();
                        async move { starter.run(shutdown).await }
                    }),
                });
            }

            info!(
                workers = workers.len(),
                projects = self.pool.projects().len(),
                "All workers started"
            );
            self.set_phase(Phase::Running);

            exited_early.extend(self.wait_for_stop(&mut shutdown, &mut workers).await);
        }

        self.set_phase(Phase::ShuttingDown);
        let mut summary = join_workers(workers).await;
        summary.exited_early = exited_early;
        self.set_phase(Phase::Stopped);

        info!(
            joined = summary.joined.len(),
            stragglers = ?summary.stragglers,
            exited_early = ?summary.exited_early,
            "Orchestrator stopped"
        );
        summary
    }

    /// Wait for a shutdown request or for any worker to stop on its own.
    /// A worker that stops first is removed from `workers`, logged, and
    /// turned into a shutdown request. Returns its name.
    async fn wait_for_stop(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        workers: &mut Vec<Worker>,
    ) -> Option<String> {
        tokio::select! {
            _ = shutdown_requested(shutdown) => None,
            (index, result) = first_exited(workers) => {
                let worker = workers.remove(index);
                match result {
                    Ok(()) => error!(worker = %worker.name, "Worker exited before shutdown"),
                    Err(e) => {
                        error!(worker = %worker.name, error = %e, "Worker failed before shutdown")
                    }
                }
                self.shutdown.request();
                Some(worker.name)
            }
        }
    }
}

/// Index and result of the first finished worker. Pending forever when
/// `workers` is empty.
async fn first_exited(workers: &mut [Worker]) -> (usize, Result<(), JoinError>) {
    std::future::poll_fn(|cx| {
        for (index, worker) in workers.iter_mut().enumerate() {
            if let Poll::Ready(result) = Pin::new(&mut worker.handle).poll(cx) {
                return Poll::Ready((index, result));
            }
        }
        Poll::Pending
    })
    .await
}

async fn join_workers(workers: Vec<Worker>) -> RunSummary {
    let mut summary = RunSummary::default();

    for worker in workers {
        let Worker {
            name,
            mut handle,
            join_timeout,
        } = worker;

        match tokio::time::timeout(join_timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!(worker = %name, "Worker stopped");
                summary.joined.push(name);
            }
            Ok(Err(e)) => {
                error!(worker = %name, error = %e, "Worker task failed");
                summary.joined.push(name);
            }
            Err(_) => {
                warn!(
                    worker = %name,
                    timeout_secs = join_timeout.as_secs(),
                    "Worker did not stop in time"
                );
                handle.abort();
                summary.stragglers.push(name);
            }
        }
    }

    summary
}
