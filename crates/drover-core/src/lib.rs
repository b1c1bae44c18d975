//! # Drover Core
//!
//! Core types and collaborator traits for managing ephemeral cloud build
//! agents: provisioning state, online tracking, and safe retirement.
//!
//! ## What lives here
//! - `Agent`: per-agent lifecycle flags behind a single exclusive section
//! - Collaborator traits for the scheduler, permissions, cloud provider and
//!   agent channel
//! - The error taxonomy and engine configuration

pub mod agent;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod permission;

pub use agent::{
    Agent, AgentId, AgentSnapshot, DeleteMode, OfflineCause, Readiness, TeardownPhase,
    TeardownTicket,
};
pub use collaborators::{
    AgentChannel, CloudProvider, Executor, JobId, PermissionChecker, Scheduler,
};
pub use config::LifecycleConfig;
pub use error::{BoxError, LifecycleError, Result, TeardownError};
pub use permission::Permission;

/// Current Drover version for compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drover build information for telemetry and debugging
pub const BUILD_INFO: &str = concat!(
    "Drover ",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CARGO_PKG_NAME"),
    ")"
);
