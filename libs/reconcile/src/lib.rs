//! Dispatch reconciliation primitives.
//!
//! This library holds the side-effect free pieces of the device pool
//! dispatcher, the parts that decide *how many* jobs to start and *which*
//! devices are already spoken for:
//!
//! - **Admission control**: how many jobs a project may start this cycle,
//!   given unmet demand, eligible devices and the global circuit breaker.
//! - **Job tracking**: a self-expiring record of devices a job was recently
//!   dispatched to, covering the window between "process launched" and
//!   "job claimed a queue entry".
//!
//! # Invariants
//!
//! - Admission decisions are deterministic given the same inputs
//! - The calculator never returns more than the eligible device count
//! - Tracker reads never observe expired entries

mod admission;
mod clock;
mod tracker;

pub use admission::{
    calculate_jobs_to_start, AdmissionLimits, Suppression, DEFAULT_GLOBAL_MAX_INITIATED_JOBS,
    DEFAULT_MAX_JOBS_PER_CYCLE,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use tracker::{JobTracker, TrackedJob, DEFAULT_JOB_EXPIRY};
