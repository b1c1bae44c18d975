//! Traits for the systems the lifecycle engine talks to
//!
//! The host scheduler, the permission layer, the cloud provider and the
//! agent's communication channel are all owned elsewhere. They are injected
//! into the engine as trait objects so tests can substitute in-memory
//! versions.

use crate::agent::Agent;
use crate::error::{BoxError, Result};
use crate::permission::Permission;
use async_trait::async_trait;
use std::sync::Arc;

/// Identifier of a job known to the scheduler queue
pub type JobId = String;

/// One executor slot on an agent
pub trait Executor: Send + Sync {
    fn slot(&self) -> usize;

    /// Interrupt whatever the slot is running. Unblocks builds that already
    /// left the queue.
    fn interrupt(&self) -> std::result::Result<(), BoxError>;
}

/// The host job scheduler's view of an agent
pub trait Scheduler: Send + Sync {
    /// Jobs currently running on the agent. `None` when the scheduler has no
    /// job list for it.
    fn running_jobs(&self, agent: &str) -> Option<Vec<JobId>>;

    /// Cancel a job in the scheduler queue
    fn cancel(&self, job: &JobId) -> std::result::Result<(), BoxError>;

    fn executors(&self, agent: &str) -> Vec<Arc<dyn Executor>>;
}

pub trait PermissionChecker: Send + Sync {
    /// Fails with `LifecycleError::PermissionDenied` when the caller lacks
    /// `permission`.
    fn check_permission(&self, permission: Permission) -> Result<()>;
}

/// Releases the cloud resources backing an agent
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn deprovision(&self, agent: &Agent) -> std::result::Result<(), BoxError>;
}

/// Live link between the scheduler and the remote agent process
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn close(&self) -> std::result::Result<(), BoxError>;
}
