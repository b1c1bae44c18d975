//! In-memory collaborators
//!
//! Stand-ins for the host scheduler, permission layer, cloud provider and
//! agent channel. Used by the simulator, tests and benches.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use drover_core::{
    Agent, AgentChannel, BoxError, CloudProvider, Executor, JobId, LifecycleError, Permission,
    PermissionChecker, Result, Scheduler,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared, ordered record of collaborator calls
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }
}

#[derive(Debug)]
pub struct InMemoryExecutor {
    slot: usize,
    interrupts: AtomicUsize,
    fail: bool,
}

impl InMemoryExecutor {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            interrupts: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// An executor whose interrupt always fails
    pub fn failing(slot: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(slot)
        }
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl Executor for InMemoryExecutor {
    fn slot(&self) -> usize {
        self.slot
    }

    fn interrupt(&self) -> std::result::Result<(), BoxError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(format!("executor {} is wedged", self.slot).into());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Workload {
    jobs: Option<Vec<JobId>>,
    executors: Vec<Arc<InMemoryExecutor>>,
}

/// Scheduler queue keyed by agent name
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    workloads: DashMap<String, Workload>,
    cancelled: Mutex<Vec<JobId>>,
    uncancellable: DashSet<JobId>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_executor(&self, agent: &str, executor: InMemoryExecutor) -> Arc<InMemoryExecutor> {
        let executor = Arc::new(executor);
        self.workloads
            .entry(agent.to_string())
            .or_default()
            .executors
            .push(executor.clone());
        executor
    }

    pub fn add_executors(&self, agent: &str, count: usize) -> Vec<Arc<InMemoryExecutor>> {
        (0..count)
            .map(|slot| self.add_executor(agent, InMemoryExecutor::new(slot)))
            .collect()
    }

    /// Hand a job to the agent if it still takes work
    pub fn dispatch(&self, agent: &Agent, job: impl Into<JobId>) -> bool {
        if !agent.accepts_work() {
            return false;
        }
        self.workloads
            .entry(agent.name().to_string())
            .or_default()
            .jobs
            .get_or_insert_with(Vec::new)
            .push(job.into());
        true
    }

    /// Make cancelling `job` fail
    pub fn refuse_cancellation(&self, job: impl Into<JobId>) {
        self.uncancellable.insert(job.into());
    }

    pub fn cancelled_jobs(&self) -> Vec<JobId> {
        self.cancelled.lock().clone()
    }
}

impl Scheduler for InMemoryScheduler {
    fn running_jobs(&self, agent: &str) -> Option<Vec<JobId>> {
        self.workloads.get(agent).and_then(|w| w.jobs.clone())
    }

    fn cancel(&self, job: &JobId) -> std::result::Result<(), BoxError> {
        if self.uncancellable.contains(job) {
            return Err(format!("job {} cannot be cancelled", job).into());
        }
        for mut workload in self.workloads.iter_mut() {
            if let Some(jobs) = workload.jobs.as_mut() {
                jobs.retain(|j| j != job);
            }
        }
        self.cancelled.lock().push(job.clone());
        Ok(())
    }

    fn executors(&self, agent: &str) -> Vec<Arc<dyn Executor>> {
        self.workloads
            .get(agent)
            .map(|w| {
                w.executors
                    .iter()
                    .map(|e| e.clone() as Arc<dyn Executor>)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Grants or refuses every permission
#[derive(Debug)]
pub struct StaticPermissions {
    allowed: AtomicBool,
    checks: AtomicUsize,
}

impl StaticPermissions {
    pub fn allow_all() -> Self {
        Self {
            allowed: AtomicBool::new(true),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            allowed: AtomicBool::new(false),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl PermissionChecker for StaticPermissions {
    fn check_permission(&self, permission: Permission) -> Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.allowed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LifecycleError::PermissionDenied {
                permission,
                reason: "caller is not allowed".to_string(),
            })
        }
    }
}

/// Cloud provider that counts deprovision calls and can be told to fail
#[derive(Debug)]
pub struct InMemoryCloudProvider {
    log: CallLog,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Duration,
}

impl InMemoryCloudProvider {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Simulate a slow provider API
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `times` deprovision calls
    pub fn fail_times(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn deprovision_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudProvider for InMemoryCloudProvider {
    async fn deprovision(&self, agent: &Agent) -> std::result::Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.record(format!("deprovision:{}", agent.name()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(format!("cloud API refused to delete {}", agent.name()).into());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryChannel {
    agent: String,
    log: CallLog,
    fail: bool,
}

impl InMemoryChannel {
    pub fn new(agent: impl Into<String>, log: CallLog) -> Self {
        Self {
            agent: agent.into(),
            log,
            fail: false,
        }
    }

    /// A channel whose close always fails
    pub fn failing(agent: impl Into<String>, log: CallLog) -> Self {
        Self {
            fail: true,
            ..Self::new(agent, log)
        }
    }
}

#[async_trait]
impl AgentChannel for InMemoryChannel {
    async fn close(&self) -> std::result::Result<(), BoxError> {
        self.log.record(format!("close:{}", self.agent));
        if self.fail {
            return Err(format!("channel to {} reset by peer", self.agent).into());
        }
        Ok(())
    }
}
