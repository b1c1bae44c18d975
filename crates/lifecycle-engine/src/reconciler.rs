//! Background retry of failed deletions
//!
//! Agents whose deprovisioning failed stay registered, offline and
//! delete-requested. The reconciler sweeps them on a fixed interval and
//! retries teardown until the cloud provider succeeds.

use crate::coordinator::{DeletionCoordinator, DeletionOutcome};
use crate::registry::AgentRegistry;
use drover_core::LifecycleConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl From<&LifecycleConfig> for ReconcilerConfig {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            interval: config.reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Teardown attempts this cycle issued
    pub retried: usize,
    pub deprovisioned: usize,
    pub failed: usize,
    /// Agents another caller was already tearing down
    pub skipped: usize,
}

pub struct DeletionReconciler {
    registry: AgentRegistry,
    coordinator: Arc<DeletionCoordinator>,
    config: ReconcilerConfig,
    shutdown_token: CancellationToken,
}

impl DeletionReconciler {
    pub fn new(
        registry: AgentRegistry,
        coordinator: Arc<DeletionCoordinator>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            coordinator,
            config: ReconcilerConfig {
                interval: config.interval.max(MIN_INTERVAL),
            },
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting deletion reconciler"
        );

        let mut tick = interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping deletion reconciler");
                    break;
                }
                _ = tick.tick() => {
                    let report = self.reconcile_once().await;
                    if report.retried > 0 || report.skipped > 0 {
                        info!(
                            retried = report.retried,
                            deprovisioned = report.deprovisioned,
                            failed = report.failed,
                            skipped = report.skipped,
                            "Deletion reconcile cycle finished"
                        );
                    } else {
                        debug!("No pending deletions");
                    }
                }
            }
        }
    }

    /// Retry teardown once for every agent with a failed deletion
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for agent in self.registry.pending_deletions() {
            match self.coordinator.teardown(&agent).await {
                Ok(DeletionOutcome::Deprovisioned) => {
                    self.registry.remove(&agent);
                    report.retried += 1;
                    report.deprovisioned += 1;
                }
                Ok(DeletionOutcome::AlreadyDeprovisioned) => {
                    self.registry.remove(&agent);
                    report.deprovisioned += 1;
                }
                Ok(DeletionOutcome::AlreadyInProgress) | Ok(DeletionOutcome::AgentGone) => {
                    debug!(agent = %agent.name(), "Teardown owned by another caller, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(agent = %agent.name(), error = %e, "Retried deletion failed");
                    report.retried += 1;
                    report.failed += 1;
                }
            }
        }

        report
    }
}
