//! Readiness waiting
//!
//! Parks a provisioning workflow until the scheduler reports the agent
//! online, then marks the agent provisioned.

use drover_core::{Agent, LifecycleConfig, LifecycleError, Readiness, Result};
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Recheck interval, on top of the online-status notifications
    pub poll_interval: Duration,
    /// Give up after this long. `None` waits until cancelled.
    pub timeout: Option<Duration>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            timeout: None,
        }
    }
}

impl From<&LifecycleConfig> for ReadinessConfig {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.wait_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadinessWaiter {
    config: ReadinessConfig,
}

impl ReadinessWaiter {
    /// A zero poll interval is raised to 1ms.
    pub fn new(mut config: ReadinessConfig) -> Self {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        Self { config }
    }

    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// Wait until `agent` is online, then set it provisioned.
    ///
    /// Wakes on every online-status change and on each poll tick. Returns
    /// `CancelledWait` if `cancel` fires, `WaitTimedOut` once the configured
    /// timeout passes and `DeletionInProgress` if teardown got to the agent
    /// first. `provisioned` is left untouched in all three cases.
    #[instrument(skip(self, agent, cancel), fields(agent = %agent.name()))]
    pub async fn wait_until_online(&self, agent: &Agent, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let deadline = self.config.timeout.map(|timeout| started + timeout);
        let mut online = agent.subscribe_online();
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                return Err(LifecycleError::CancelledWait {
                    agent: agent.name().to_string(),
                });
            }

            match agent.confirm_readiness() {
                Readiness::Provisioned => {
                    info!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Agent online, marked provisioned"
                    );
                    return Ok(());
                }
                Readiness::DeletionInProgress => {
                    return Err(LifecycleError::DeletionInProgress {
                        agent: agent.name().to_string(),
                    });
                }
                Readiness::NotOnline => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Readiness wait cancelled");
                    return Err(LifecycleError::CancelledWait {
                        agent: agent.name().to_string(),
                    });
                }
                _ = wait_for_deadline(deadline) => {
                    return Err(LifecycleError::WaitTimedOut {
                        agent: agent.name().to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        return Err(LifecycleError::AgentNotFound {
                            agent: agent.name().to_string(),
                        });
                    }
                }
                _ = ticker.tick() => {
                    debug!("Agent not online yet");
                }
            }
        }
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
