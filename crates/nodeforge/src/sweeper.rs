//! Periodic orphan sweep.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::orchestrator::Orchestrator;

/// Runs [`Orchestrator::cleanup_orphans`] on a fixed interval.
pub struct OrphanSweeper {
    orchestrator: Orchestrator,
    interval: Duration,
    threshold: Duration,
}

impl OrphanSweeper {
    /// Interval and age threshold come from `[service]`.
    pub fn new(orchestrator: Orchestrator) -> Self {
        let config = orchestrator.config();
        let interval = Duration::from_secs(config.service.orphan_sweep_interval_secs);
        let threshold = config.orphan_age_threshold();
        Self {
            orchestrator,
            interval,
            threshold,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass. Returns how many owners were cleaned completely.
    pub async fn sweep_once(&self) -> usize {
        match self.orchestrator.cleanup_orphans(Some(self.threshold)).await {
            Ok(summaries) => {
                let complete = summaries.iter().filter(|s| s.is_complete()).count();
                for partial in summaries.iter().filter(|s| !s.is_complete()) {
                    warn!(owner = %partial.owner, result = %partial.describe(), "orphan cleanup incomplete");
                }
                if summaries.is_empty() {
                    debug!("no orphans found");
                } else {
                    info!(owners = summaries.len(), complete, "orphan sweep finished");
                }
                complete
            }
            Err(e) => {
                error!(error = %e, "orphan sweep failed");
                0
            }
        }
    }

    /// Sweep until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "orphan sweeper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    info!("orphan sweeper shutting down");
                    break;
                }
            }
        }
    }
}
