//! Public entry points for the agent lifecycle
//!
//! Every deletion path checks `Permission::Delete` before touching an agent.
//! Teardown failures come back as `LifecycleError::DeletionFailed`, with the
//! agent left offline for the reconciler.

use crate::coordinator::{DeletionCoordinator, DeletionOutcome};
use crate::readiness::{ReadinessConfig, ReadinessWaiter};
use crate::registry::AgentRegistry;
use drover_core::{
    Agent, AgentSnapshot, CloudProvider, DeleteMode, LifecycleConfig, LifecycleError, Permission,
    PermissionChecker, Result, Scheduler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};

pub struct AgentLifecycle {
    registry: AgentRegistry,
    permissions: Arc<dyn PermissionChecker>,
    coordinator: Arc<DeletionCoordinator>,
    waiter: ReadinessWaiter,
}

impl std::fmt::Debug for AgentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLifecycle")
            .field("registry", &self.registry)
            .field("coordinator", &self.coordinator)
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl AgentLifecycle {
    /// Fails with `InvalidConfig` if `config` does not validate.
    pub fn new(
        registry: AgentRegistry,
        permissions: Arc<dyn PermissionChecker>,
        scheduler: Arc<dyn Scheduler>,
        cloud: Arc<dyn CloudProvider>,
        config: &LifecycleConfig,
    ) -> Result<Self> {
        config.validate()?;
        let coordinator = DeletionCoordinator::new(scheduler, cloud)
            .with_offline_cause(config.offline_cause.clone());
        Ok(Self {
            registry,
            permissions,
            coordinator: Arc::new(coordinator),
            waiter: ReadinessWaiter::new(ReadinessConfig::from(config)),
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Shared with the background reconciler
    pub fn coordinator(&self) -> Arc<DeletionCoordinator> {
        self.coordinator.clone()
    }

    /// Operator deletion with a raw mode token (the `deleteMode` request
    /// parameter). `"0"` stops running work first; anything else deletes
    /// immediately.
    ///
    /// `Ok(DeletionOutcome::AlreadyInProgress)` only means another caller
    /// owns the teardown. It does not mean the cloud resources were
    /// released: that attempt may still fail and leave the agent for the
    /// reconciler. Only `Deprovisioned` and `AlreadyDeprovisioned` confirm
    /// release.
    #[instrument(skip(self))]
    pub async fn handle_delete_request(
        &self,
        agent: &str,
        raw_mode: Option<&str>,
    ) -> Result<DeletionOutcome> {
        self.permissions.check_permission(Permission::Delete)?;
        let mode = DeleteMode::from_request_param(raw_mode);
        self.delete(agent, mode).await
    }

    /// Immediate deletion for non-interactive callers. Outcomes read as for
    /// [`AgentLifecycle::handle_delete_request`].
    #[instrument(skip(self))]
    pub async fn delete_unconditionally(&self, agent: &str) -> Result<DeletionOutcome> {
        self.permissions.check_permission(Permission::Delete)?;
        self.delete(agent, DeleteMode::Immediate).await
    }

    async fn delete(&self, name: &str, mode: DeleteMode) -> Result<DeletionOutcome> {
        let agent = self.registry.get(name);
        match self.coordinator.request_deletion(agent.as_deref(), mode).await {
            Ok(outcome) => {
                let released = matches!(
                    outcome,
                    DeletionOutcome::Deprovisioned | DeletionOutcome::AlreadyDeprovisioned
                );
                if let (true, Some(agent)) = (released, &agent) {
                    self.registry.remove(agent);
                }
                Ok(outcome)
            }
            Err(source) => {
                error!(agent = %name, "Deletion failed, agent left offline for cleanup");
                Err(LifecycleError::DeletionFailed {
                    agent: name.to_string(),
                    source,
                })
            }
        }
    }

    pub fn agent(&self, name: &str) -> Result<Arc<Agent>> {
        self.registry
            .get(name)
            .ok_or_else(|| LifecycleError::AgentNotFound {
                agent: name.to_string(),
            })
    }

    pub fn is_provisioned(&self, name: &str) -> Result<bool> {
        Ok(self.agent(name)?.is_provisioned())
    }

    pub fn set_provisioned(&self, name: &str, provisioned: bool) -> Result<()> {
        self.agent(name)?.set_provisioned(provisioned);
        Ok(())
    }

    /// Block until the agent is online and mark it provisioned
    pub async fn wait_until_online(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let agent = self.agent(name)?;
        self.waiter.wait_until_online(&agent, cancel).await
    }

    pub fn snapshot(&self, name: &str) -> Result<AgentSnapshot> {
        Ok(self.agent(name)?.snapshot())
    }
}
