use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::fleet::Coordinator;

#[derive(Debug, Clone)]
pub struct SweepWorkerConfig {
    pub interval: Duration,
}

impl Default for SweepWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Periodically evicts silent nodes, expires messages and reclaims objects.
pub struct SweepWorker {
    coordinator: Coordinator,
    config: SweepWorkerConfig,
}

impl SweepWorker {
    pub fn new(coordinator: Coordinator, config: SweepWorkerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            "Starting sweep worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweep worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_sweep(&self) {
        match self.coordinator.sweep().await {
            Ok(report) if report.is_empty() => debug!("Sweep pass found nothing to do"),
            Ok(report) => {
                info!(
                    evicted_nodes = report.evicted_nodes,
                    expired_messages = report.expired_messages,
                    purged_messages = report.purged_messages,
                    reclaimed_objects = report.reclaimed_objects,
                    collected_objects = report.collected_objects,
                    "Sweep pass complete"
                );
            }
            Err(e) => {
                error!(error = %e, "Sweep pass failed");
            }
        }
    }
}
