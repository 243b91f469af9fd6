//! Shutdown signalling with escalation.
//!
//! The first termination signal asks every worker to stop at its next wait.
//! A second one is acknowledged but changes nothing. The third forces the
//! process to exit immediately with a non-zero status.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;
use tracing::{error, info, warn};

/// Signal count at which the process exits without waiting for workers.
pub const FORCE_EXIT_SIGNAL_COUNT: u32 = 3;

/// Exit status used for a forced exit.
pub const FORCE_EXIT_CODE: i32 = 1;

/// What a received signal means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// First signal: graceful shutdown started.
    Graceful,
    /// A later signal while shutdown is already in progress.
    AlreadyStopping { count: u32 },
    /// Enough signals to abandon the graceful path.
    ForceExit,
}

/// Owner of the cancellation flag shared by all workers.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
    signals: AtomicU32,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx,
            signals: AtomicU32::new(0),
        }
    }

    /// A receiver that observes `true` once shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Request shutdown without counting towards escalation.
    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Number of termination signals received so far.
    pub fn signal_count(&self) -> u32 {
        self.signals.load(Ordering::SeqCst)
    }

    /// Record a termination signal and return how to react to it.
    pub fn on_signal(&self) -> Escalation {
        let count = self.signals.fetch_add(1, Ordering::SeqCst) + 1;
        self.request();

        if count >= FORCE_EXIT_SIGNAL_COUNT {
            Escalation::ForceExit
        } else if count == 1 {
            Escalation::Graceful
        } else {
            Escalation::AlreadyStopping { count }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Listen for SIGINT, SIGTERM and SIGUSR2 until the process exits.
///
/// Returns only if a signal handler could not be installed.
#[cfg(unix)]
pub async fn listen_for_signals(controller: std::sync::Arc<ShutdownController>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigusr2.recv() => "SIGUSR2",
        };

        match controller.on_signal() {
            Escalation::Graceful => {
                info!(signal = name, "Received termination signal, shutting down gracefully");
            }
            Escalation::AlreadyStopping { count } => {
                warn!(
                    signal = name,
                    count,
                    force_exit_at = FORCE_EXIT_SIGNAL_COUNT,
                    "Shutdown already in progress"
                );
            }
            Escalation::ForceExit => {
                error!(signal = name, "Received repeated termination signals, exiting immediately");
                std::process::exit(FORCE_EXIT_CODE);
            }
        }
    }
}
