//! Periodic workers that refresh [`SharedState`](crate::state::SharedState).

mod devices;
mod queue;

pub use devices::DeviceMonitor;
pub use queue::{QueueMonitor, QueuePass};

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// Interval timer whose first tick fires immediately and which does not
/// burst to catch up after a slow pass.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Wait until shutdown is requested or the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
