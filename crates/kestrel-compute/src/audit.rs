//! Periodic resource audit.
//!
//! Every interval each tracked node re-probes its host and rebuilds usage
//! from the containers placed on it. A failing node is logged and skipped;
//! the others are still audited.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::tracker::ComputeNodeTracker;

pub struct ResourceAuditor {
    trackers: Vec<Arc<ComputeNodeTracker>>,
    interval: Duration,
}

impl ResourceAuditor {
    pub fn new(trackers: Vec<Arc<ComputeNodeTracker>>, interval: Duration) -> Self {
        Self { trackers, interval }
    }

    /// Audit every node once. Returns the number of nodes that failed.
    pub async fn audit_once(&self) -> usize {
        let mut failed = 0;
        for tracker in &self.trackers {
            if let Err(e) = tracker.update_available_resource().await {
                failed += 1;
                error!(host = %tracker.hostname(), error = %e, "resource audit failed");
            }
        }
        info!(nodes = self.trackers.len(), failed, "resource audit pass finished");
        failed
    }

    /// Audit until `shutdown` flips. The first pass runs immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(interval_ms = self.interval.as_millis() as u64, "audit loop starting");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.audit_once().await;
                }
                _ = shutdown.changed() => {
                    debug!("audit loop shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
