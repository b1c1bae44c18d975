//! Lifecycle engine configuration

use crate::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_POLL_INTERVAL_MS: &str = "DROVER_POLL_INTERVAL_MS";
pub const ENV_WAIT_TIMEOUT_MS: &str = "DROVER_WAIT_TIMEOUT_MS";
pub const ENV_RECONCILE_INTERVAL_MS: &str = "DROVER_RECONCILE_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How often a readiness wait rechecks the online flag
    pub poll_interval_ms: u64,
    /// Upper bound on a readiness wait. `None` waits until cancelled.
    pub wait_timeout_ms: Option<u64>,
    /// How often failed deletions are retried in the background
    pub reconcile_interval_ms: u64,
    /// Offline cause shown to users while an agent is deleted
    pub offline_cause: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            wait_timeout_ms: None,
            reconcile_interval_ms: 60_000,
            offline_cause: "Agent is being deleted".to_string(),
        }
    }
}

impl LifecycleConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| LifecycleError::InvalidConfig {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&raw)
    }

    /// Apply `DROVER_*` environment overrides on top of `self`
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = parse_millis(ENV_POLL_INTERVAL_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WAIT_TIMEOUT_MS) {
            self.wait_timeout_ms = if raw.trim().is_empty() {
                None
            } else {
                Some(parse_millis(ENV_WAIT_TIMEOUT_MS, &raw)?)
            };
        }
        if let Some(raw) = lookup(ENV_RECONCILE_INTERVAL_MS) {
            self.reconcile_interval_ms = parse_millis(ENV_RECONCILE_INTERVAL_MS, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(LifecycleError::InvalidConfig {
                reason: "poll_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.reconcile_interval_ms == 0 {
            return Err(LifecycleError::InvalidConfig {
                reason: "reconcile_interval_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| LifecycleError::InvalidConfig {
            reason: format!("{} must be a number of milliseconds, got {:?}", key, raw),
        })
}
