//! Periodic stale-job sweep (spec.md §4.3).
//!
//! Grounded on the base crate's graceful-shutdown primitive (a `Notify`
//! shared with long-running background tasks) generalized to a
//! `tokio_util::sync::CancellationToken`, which composes more naturally
//! with `tokio::select!` across the watchdog, worker, and proxy tasks
//! that all need to observe the same shutdown signal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::Queue;

/// Runs `Queue::fail_stale_jobs` every `watchdog_interval_seconds` until
/// cancelled.
pub struct Watchdog {
    queue: Queue,
    interval: std::time::Duration,
    shutdown: CancellationToken,
}

impl Watchdog {
    pub fn new(queue: Queue, interval: std::time::Duration, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            interval,
            shutdown,
        }
    }

    /// Runs until `shutdown` is cancelled. Never returns an error: a
    /// single sweep failing is logged and the loop continues, since a
    /// stuck broker connection shouldn't stop future sweeps once it
    /// recovers.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("watchdog shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match self.queue.fail_stale_jobs().await {
                        Ok(failed) if !failed.is_empty() => {
                            warn!(count = failed.len(), "watchdog failed stale jobs");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "watchdog sweep failed");
                        }
                    }
                }
            }
        }
    }
}

/// Spawns the watchdog loop as a detached task, returning its handle.
pub fn spawn(queue: Queue, interval: std::time::Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let watchdog = Watchdog::new(queue, interval, shutdown);
    tokio::spawn(watchdog.run())
}
