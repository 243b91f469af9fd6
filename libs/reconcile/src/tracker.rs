//! Tracking of devices with recently dispatched jobs.
//!
//! A launched job needs a few minutes to boot, install its dependencies,
//! start the queue worker and claim a task. During that window the farm
//! already reports the device busy (or not yet), while the queue still shows
//! the task as pending. The tracker remembers which devices we dispatched to
//! so the same demand is not answered twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};

/// Default claim window for a dispatched job.
pub const DEFAULT_JOB_EXPIRY: Duration = Duration::from_secs(210);

/// A device with a recently dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJob {
    pub device_id: String,
    pub started_at: Instant,
}

/// Self-expiring set of recently dispatched device ids.
///
/// Every read purges expired entries first, so callers never see stale
/// claims and no background sweep is needed. The tracker is owned by a
/// single job starter and is not internally synchronized.
pub struct JobTracker {
    expiry: Duration,
    clock: Arc<dyn Clock>,
    started: HashMap<String, Instant>,
}

impl JobTracker {
    /// Create a tracker backed by the system clock.
    pub fn new(expiry: Duration) -> Self {
        Self::with_clock(expiry, Arc::new(SystemClock))
    }

    /// Create a tracker with an explicit time source.
    pub fn with_clock(expiry: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            expiry,
            clock,
            started: HashMap::new(),
        }
    }

    /// Configured claim window.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Record that jobs were just dispatched to these devices.
    ///
    /// Re-recording a tracked device refreshes its timestamp.
    pub fn record_jobs<I, S>(&mut self, device_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.clock.now();
        for id in device_ids {
            self.started.insert(id.into(), now);
        }
    }

    /// Number of devices with an unexpired dispatch.
    pub fn active_count(&mut self) -> usize {
        self.purge_expired();
        self.started.len()
    }

    /// Devices with an unexpired dispatch, sorted.
    pub fn active_device_ids(&mut self) -> Vec<String> {
        self.purge_expired();
        let mut ids: Vec<String> = self.started.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a device has an unexpired dispatch.
    pub fn is_active(&mut self, device_id: &str) -> bool {
        self.purge_expired();
        self.started.contains_key(device_id)
    }

    /// Unexpired dispatches, oldest first.
    pub fn jobs(&mut self) -> Vec<TrackedJob> {
        self.purge_expired();
        let mut jobs: Vec<TrackedJob> = self
            .started
            .iter()
            .map(|(id, at)| TrackedJob {
                device_id: id.clone(),
                started_at: *at,
            })
            .collect();
        jobs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        jobs
    }

    /// Drop entries immediately, ignoring the timer.
    ///
    /// Intended for tests and debugging.
    pub fn force_expire<I, S>(&mut self, device_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in device_ids {
            self.started.remove(id.as_ref());
        }
    }

    /// Forget all tracked dispatches.
    pub fn clear(&mut self) {
        self.started.clear();
    }

    fn purge_expired(&mut self) {
        let now = self.clock.now();
        let expiry = self.expiry;
        self.started
            .retain(|_, started_at| now.saturating_duration_since(*started_at) <= expiry);
    }
}

impl std::fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTracker")
            .field("expiry", &self.expiry)
            .field("tracked", &self.started.len())
            .finish()
    }
}
