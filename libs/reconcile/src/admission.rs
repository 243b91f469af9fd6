//! Admission control for job dispatch.

/// Maximum number of jobs a single project may start in one cycle.
pub const DEFAULT_MAX_JOBS_PER_CYCLE: usize = 10;

/// Global "initiated" job count above which no project dispatches.
///
/// Jobs sit in the farm's initiated state while they wait for a device
/// session. A large backlog there means the farm is not keeping up, and
/// starting more jobs only deepens the hole.
pub const DEFAULT_GLOBAL_MAX_INITIATED_JOBS: u64 = 40;

/// Caps applied by the admission calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Upper bound on jobs started by one project in one cycle.
    pub max_per_cycle: usize,

    /// Circuit-breaker threshold on the farm-wide initiated job count.
    pub global_max_initiated: u64,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_per_cycle: DEFAULT_MAX_JOBS_PER_CYCLE,
            global_max_initiated: DEFAULT_GLOBAL_MAX_INITIATED_JOBS,
        }
    }
}

/// Why a cycle decided to start nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// The global initiated count is over the cap.
    CircuitBreaker,

    /// All pending work is already covered by recently dispatched jobs.
    NoDemand,

    /// No eligible device is left once claimed devices are excluded.
    NoDevices,

    /// The per-cycle cap is zero.
    CycleCapZero,
}

impl Suppression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitBreaker => "circuit_breaker",
            Self::NoDemand => "no_demand",
            Self::NoDevices => "no_devices",
            Self::CycleCapZero => "cycle_cap_zero",
        }
    }
}

impl std::fmt::Display for Suppression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AdmissionLimits {
    /// Calculate how many jobs to start this cycle.
    ///
    /// `pending_not_handled` is the queue depth minus the jobs already
    /// believed in flight, so it may be negative.
    pub fn jobs_to_start(
        &self,
        pending_not_handled: i64,
        available_device_count: usize,
        global_initiated: u64,
    ) -> usize {
        if global_initiated > self.global_max_initiated {
            return 0;
        }

        if pending_not_handled <= 0 {
            return 0;
        }

        let pending = usize::try_from(pending_not_handled).unwrap_or(usize::MAX);
        pending
            .min(self.max_per_cycle)
            .min(available_device_count)
    }

    /// Explain a zero decision. Returns `None` when jobs would be started.
    ///
    /// Inputs are checked in the same order the calculator applies them.
    pub fn suppression(
        &self,
        pending_not_handled: i64,
        available_device_count: usize,
        global_initiated: u64,
    ) -> Option<Suppression> {
        if global_initiated > self.global_max_initiated {
            Some(Suppression::CircuitBreaker)
        } else if pending_not_handled <= 0 {
            Some(Suppression::NoDemand)
        } else if self.max_per_cycle == 0 {
            Some(Suppression::CycleCapZero)
        } else if available_device_count == 0 {
            Some(Suppression::NoDevices)
        } else {
            None
        }
    }
}

/// Calculate jobs to start with the default circuit-breaker threshold.
///
/// Returns `max(0, min(pending_not_handled, max_per_cycle, available_device_count))`,
/// or 0 when `global_initiated` exceeds [`DEFAULT_GLOBAL_MAX_INITIATED_JOBS`].
pub fn calculate_jobs_to_start(
    pending_not_handled: i64,
    available_device_count: usize,
    global_initiated: u64,
    max_per_cycle: usize,
) -> usize {
    AdmissionLimits {
        max_per_cycle,
        ..AdmissionLimits::default()
    }
    .jobs_to_start(pending_not_handled, available_device_count, global_initiated)
}
