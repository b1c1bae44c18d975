//! Deletion coordinator
//!
//! Retires an agent: optionally stops its work, takes it out of dispatch,
//! closes its channel and releases its cloud resources, in that order.

use drover_core::{
    Agent, CloudProvider, DeleteMode, OfflineCause, Scheduler, TeardownError, TeardownTicket,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_OFFLINE_CAUSE: &str = "Agent is being deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionOutcome {
    /// This call released the agent's cloud resources
    Deprovisioned,
    /// Another caller is tearing the agent down right now
    AlreadyInProgress,
    AlreadyDeprovisioned,
    /// The agent no longer exists
    AgentGone,
}

/// What a graceful stop managed to do. Failures are counted, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    pub jobs_cancelled: usize,
    pub cancel_failures: usize,
    pub executors_interrupted: usize,
    pub interrupt_failures: usize,
}

pub struct DeletionCoordinator {
    scheduler: Arc<dyn Scheduler>,
    cloud: Arc<dyn CloudProvider>,
    offline_cause: String,
}

impl std::fmt::Debug for DeletionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionCoordinator")
            .field("offline_cause", &self.offline_cause)
            .finish()
    }
}

/// Hands a failed or abandoned teardown back to idle so it can be retried.
struct TeardownClaim<'a> {
    agent: &'a Agent,
    finished: bool,
}

impl<'a> TeardownClaim<'a> {
    fn new(agent: &'a Agent) -> Self {
        Self {
            agent,
            finished: false,
        }
    }

    fn finish(mut self, deprovisioned: bool) {
        self.agent.finish_teardown(deprovisioned);
        self.finished = true;
    }
}

impl Drop for TeardownClaim<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(agent = %self.agent.name(), "Teardown abandoned before deprovision finished");
            self.agent.finish_teardown(false);
        }
    }
}

impl DeletionCoordinator {
    pub fn new(scheduler: Arc<dyn Scheduler>, cloud: Arc<dyn CloudProvider>) -> Self {
        Self {
            scheduler,
            cloud,
            offline_cause: DEFAULT_OFFLINE_CAUSE.to_string(),
        }
    }

    pub fn with_offline_cause(mut self, cause: impl Into<String>) -> Self {
        self.offline_cause = cause.into();
        self
    }

    /// Delete an agent. `None` means the agent is already gone and is not an
    /// error. Fails only when deprovisioning fails.
    #[instrument(skip(self, agent), fields(mode = %mode))]
    pub async fn request_deletion(
        &self,
        agent: Option<&Agent>,
        mode: DeleteMode,
    ) -> Result<DeletionOutcome, TeardownError> {
        let Some(agent) = agent else {
            debug!("Deletion requested for an agent that no longer exists");
            return Ok(DeletionOutcome::AgentGone);
        };

        info!(agent = %agent.name(), "Deletion requested");

        if mode == DeleteMode::GracefulStop {
            let report = self.stop_work(agent);
            info!(
                agent = %agent.name(),
                jobs_cancelled = report.jobs_cancelled,
                cancel_failures = report.cancel_failures,
                executors_interrupted = report.executors_interrupted,
                interrupt_failures = report.interrupt_failures,
                "Graceful stop finished"
            );
        }

        self.teardown(agent).await
    }

    /// Cancel the agent's running jobs, then interrupt each executor slot.
    /// Best effort: failures are logged and counted.
    pub fn stop_work(&self, agent: &Agent) -> StopReport {
        let mut report = StopReport::default();

        for job in self.scheduler.running_jobs(agent.name()).unwrap_or_default() {
            match self.scheduler.cancel(&job) {
                Ok(()) => report.jobs_cancelled += 1,
                Err(e) => {
                    warn!(agent = %agent.name(), job = %job, error = %e, "Failed to cancel job");
                    report.cancel_failures += 1;
                }
            }
        }

        for executor in self.scheduler.executors(agent.name()) {
            match executor.interrupt() {
                Ok(()) => report.executors_interrupted += 1,
                Err(e) => {
                    warn!(
                        agent = %agent.name(),
                        slot = executor.slot(),
                        error = %e,
                        "Failed to interrupt executor"
                    );
                    report.interrupt_failures += 1;
                }
            }
        }

        report
    }

    /// Mark offline, mark delete-requested, close the channel, deprovision.
    ///
    /// Concurrent callers on the same agent do not repeat the channel close
    /// or the deprovision call; they get `AlreadyInProgress`. No lock is held
    /// across the channel close or the provider call.
    #[instrument(skip(self, agent), fields(agent = %agent.name()))]
    pub async fn teardown(&self, agent: &Agent) -> Result<DeletionOutcome, TeardownError> {
        let channel = match agent.begin_teardown(OfflineCause::new(self.offline_cause.as_str())) {
            TeardownTicket::Proceed { channel } => channel,
            TeardownTicket::InProgress => {
                debug!("Teardown already in progress");
                return Ok(DeletionOutcome::AlreadyInProgress);
            }
            TeardownTicket::Completed => {
                debug!("Agent already deprovisioned");
                return Ok(DeletionOutcome::AlreadyDeprovisioned);
            }
        };
        let claim = TeardownClaim::new(agent);

        let mut channel_close_error = None;
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close agent channel, continuing teardown");
                channel_close_error = Some(e);
            }
        }

        match self.cloud.deprovision(agent).await {
            Ok(()) => {
                claim.finish(true);
                info!("Agent deprovisioned");
                Ok(DeletionOutcome::Deprovisioned)
            }
            Err(source) => {
                claim.finish(false);
                error!(error = %source, "Failed to deprovision agent");
                Err(TeardownError::new(agent.name(), source)
                    .with_channel_close_error(channel_close_error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{
        CallLog, InMemoryChannel, InMemoryCloudProvider, InMemoryExecutor, InMemoryScheduler,
    };
    use drover_core::TeardownPhase;
    use std::time::Duration;

    struct Fixture {
        log: CallLog,
        scheduler: Arc<InMemoryScheduler>,
        cloud: Arc<InMemoryCloudProvider>,
        coordinator: Arc<DeletionCoordinator>,
    }

    fn fixture(delay: Duration) -> Fixture {
        let log = CallLog::new();
        let scheduler = Arc::new(InMemoryScheduler::new());
        let cloud = Arc::new(InMemoryCloudProvider::new(log.clone()).with_delay(delay));
        let coordinator = Arc::new(DeletionCoordinator::new(scheduler.clone(), cloud.clone()));
        Fixture {
            log,
            scheduler,
            cloud,
            coordinator,
        }
    }

    fn online_agent(name: &str, log: &CallLog) -> Arc<Agent> {
        let agent = Agent::with_channel(name, Box::new(InMemoryChannel::new(name, log.clone())));
        agent.set_online(true);
        Arc::new(agent)
    }

    #[tokio::test]
    async fn missing_agent_is_a_no_op() {
        let fx = fixture(Duration::ZERO);
        let outcome = fx
            .coordinator
            .request_deletion(None, DeleteMode::GracefulStop)
            .await
            .unwrap();
        assert_eq!(outcome, DeletionOutcome::AgentGone);
        assert_eq!(fx.cloud.deprovision_calls(), 0);
    }

    #[tokio::test]
    async fn channel_closes_before_deprovision() {
        let fx = fixture(Duration::ZERO);
        let agent = online_agent("azure-1", &fx.log);

        let outcome = fx
            .coordinator
            .request_deletion(Some(agent.as_ref()), DeleteMode::Immediate)
            .await
            .unwrap();

        assert_eq!(outcome, DeletionOutcome::Deprovisioned);
        assert_eq!(
            fx.log.entries(),
            vec!["close:azure-1".to_string(), "deprovision:azure-1".to_string()]
        );
        assert!(agent.is_temporarily_offline());
        assert!(agent.is_delete_requested());
        assert!(!agent.has_channel());
        assert_eq!(agent.teardown_phase(), TeardownPhase::Completed);
    }

    #[tokio::test]
    async fn graceful_stop_cancels_jobs_and_interrupts_executors() {
        let fx = fixture(Duration::ZERO);
        let agent = online_agent("azure-2", &fx.log);
        let executors = fx.scheduler.add_executors("azure-2", 2);
        assert!(fx.scheduler.dispatch(&agent, "build-1"));
        assert!(fx.scheduler.dispatch(&agent, "build-2"));

        fx.coordinator
            .request_deletion(Some(agent.as_ref()), DeleteMode::GracefulStop)
            .await
            .unwrap();

        assert_eq!(
            fx.scheduler.cancelled_jobs(),
            vec!["build-1".to_string(), "build-2".to_string()]
        );
        assert!(executors.iter().all(|e| e.interrupts() == 1));
    }

    #[tokio::test]
    async fn immediate_mode_leaves_jobs_alone() {
        let fx = fixture(Duration::ZERO);
        let agent = online_agent("azure-3", &fx.log);
        let executors = fx.scheduler.add_executors("azure-3", 1);
        assert!(fx.scheduler.dispatch(&agent, "build-1"));

        fx.coordinator
            .request_deletion(Some(agent.as_ref()), DeleteMode::Immediate)
            .await
            .unwrap();

        assert!(fx.scheduler.cancelled_jobs().is_empty());
        assert_eq!(executors[0].interrupts(), 0);
    }

    #[tokio::test]
    async fn stop_failures_do_not_block_deletion() {
        let fx = fixture(Duration::ZERO);
        let agent = online_agent("azure-4", &fx.log);
        fx.scheduler.add_executor("azure-4", InMemoryExecutor::failing(0));
        fx.scheduler.add_executor("azure-4", InMemoryExecutor::new(1));
        assert!(fx.scheduler.dispatch(&agent, "stuck"));
        fx.scheduler.refuse_cancellation("stuck");

        let report = fx.coordinator.stop_work(&agent);
        assert_eq!(
            report,
            StopReport {
                jobs_cancelled: 0,
                cancel_failures: 1,
                executors_interrupted: 1,
                interrupt_failures: 1,
            }
        );

        let outcome = fx
            .coordinator
            .request_deletion(Some(agent.as_ref()), DeleteMode::GracefulStop)
            .await
            .unwrap();
        assert_eq!(outcome, DeletionOutcome::Deprovisioned);
    }

    #[tokio::test]
    async fn deprovision_failure_surfaces_teardown_error() {
        let fx = fixture(Duration::ZERO);
        let agent = online_agent("azure-5", &fx.log);
        fx.cloud.fail_times(1);

        let err = fx
            .coordinator
            .request_deletion(Some(agent.as_ref()), DeleteMode::Immediate)
            .await
            .unwrap_err();

        assert_eq!(err.agent, "azure-5");
        assert!(err.source.to_string().contains("refused"));
        assert!(err.channel_close_error.is_none());
        assert!(agent.is_temporarily_offline());
        assert!(agent.needs_teardown_retry());

        let retry = fx.coordinator.teardown(&agent).await.unwrap();
        assert_eq!(retry, DeletionOutcome::Deprovisioned);
        assert_eq!(fx.cloud.deprovision_calls(), 2);
    }

    #[tokio::test]
    async fn channel_close_failure_is_reported_with_deprovision_failure() {
        let fx = fixture(Duration::ZERO);
        let agent = Agent::with_channel(
            "azure-6",
            Box::new(InMemoryChannel::failing("azure-6", fx.log.clone())),
        );
        fx.cloud.fail_times(1);

        let err = fx.coordinator.teardown(&agent).await.unwrap_err();
        assert!(err.channel_close_error.is_some());
        assert_eq!(
            fx.log.entries(),
            vec!["close:azure-6".to_string(), "deprovision:azure-6".to_string()]
        );
    }

    #[tokio::test]
    async fn channel_close_failure_alone_does_not_fail_deletion() {
        let fx = fixture(Duration::ZERO);
        let agent = Agent::with_channel(
            "azure-7",
            Box::new(InMemoryChannel::failing("azure-7", fx.log.clone())),
        );

        let outcome = fx.coordinator.teardown(&agent).await.unwrap();
        assert_eq!(outcome, DeletionOutcome::Deprovisioned);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deletions_deprovision_once() {
        let fx = fixture(Duration::from_millis(50));
        let agent = online_agent("azure-8", &fx.log);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = fx.coordinator.clone();
                let agent = agent.clone();
                tokio::spawn(async move {
                    coordinator
                        .request_deletion(Some(agent.as_ref()), DeleteMode::GracefulStop)
                        .await
                })
            })
            .collect();

        let mut deprovisioned = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                DeletionOutcome::Deprovisioned => deprovisioned += 1,
                DeletionOutcome::AlreadyInProgress | DeletionOutcome::AlreadyDeprovisioned => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(deprovisioned, 1);
        assert_eq!(fx.cloud.deprovision_calls(), 1);
        assert_eq!(fx.log.entries().len(), 2);
    }

    #[tokio::test]
    async fn dropped_teardown_can_be_retried() {
        let fx = fixture(Duration::from_secs(60));
        let agent = online_agent("azure-9", &fx.log);

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            fx.coordinator.teardown(&agent),
        )
        .await;
        assert!(attempt.is_err());
        assert!(agent.needs_teardown_retry());
        assert!(agent.is_temporarily_offline());
    }
}
