pub use drover_core;

mod coordinator;
mod facade;
pub mod in_memory;
mod readiness;
mod reconciler;
mod registry;

pub use coordinator::{DeletionCoordinator, DeletionOutcome, StopReport};
pub use facade::AgentLifecycle;
pub use readiness::{ReadinessConfig, ReadinessWaiter};
pub use reconciler::{DeletionReconciler, ReconcileReport, ReconcilerConfig};
pub use registry::AgentRegistry;

// Re-export core types for convenience
pub use drover_core::{
    Agent, AgentSnapshot, DeleteMode, LifecycleConfig, LifecycleError, Result, TeardownError,
};
