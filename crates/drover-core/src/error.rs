//! Error types for the Drover lifecycle engine

use crate::permission::Permission;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Error type returned by external collaborators (cloud provider, channel,
/// scheduler queue).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Permission denied: {permission} ({reason})")]
    PermissionDenied {
        permission: Permission,
        reason: String,
    },

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error(
        "Error deleting agent {agent}, it will be cleaned up automatically after some time"
    )]
    DeletionFailed {
        agent: String,
        #[source]
        source: TeardownError,
    },

    #[error("Wait for agent {agent} to come online was cancelled")]
    CancelledWait { agent: String },

    #[error("Agent {agent} did not come online within {waited_ms}ms")]
    WaitTimedOut { agent: String, waited_ms: u64 },

    #[error("Agent {agent} is being deleted")]
    DeletionInProgress { agent: String },

    #[error("Agent not found: {agent}")]
    AgentNotFound { agent: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Serialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },
}

impl LifecycleError {
    /// True for failures that leave cloud resources behind and need an
    /// operator or the reconciler to act.
    pub fn is_teardown_failure(&self) -> bool {
        matches!(
            self,
            LifecycleError::Teardown(_) | LifecycleError::DeletionFailed { .. }
        )
    }
}

/// Deprovisioning failed for an agent.
///
/// The agent stays marked offline and delete-requested. A channel close
/// failure seen during the same attempt is carried alongside the root cause.
#[derive(Error, Debug)]
#[error("Failed to deprovision agent {agent}: {source}")]
pub struct TeardownError {
    pub agent: String,
    #[source]
    pub source: BoxError,
    pub channel_close_error: Option<BoxError>,
}

impl TeardownError {
    pub fn new(agent: impl Into<String>, source: BoxError) -> Self {
        Self {
            agent: agent.into(),
            source,
            channel_close_error: None,
        }
    }

    pub fn with_channel_close_error(mut self, error: Option<BoxError>) -> Self {
        self.channel_close_error = error;
        self
    }
}
