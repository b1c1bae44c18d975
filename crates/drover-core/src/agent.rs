//! Agent types and per-agent lifecycle state

use crate::collaborators::AgentChannel;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

pub type AgentId = Uuid;

/// Why an agent was taken out of dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineCause {
    pub message: String,
    pub since: DateTime<Utc>,
}

impl OfflineCause {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            since: Utc::now(),
        }
    }
}

impl fmt::Display for OfflineCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (since {})", self.message, self.since.to_rfc3339())
    }
}

/// How an agent should be deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteMode {
    /// Cancel running jobs and interrupt executors, then tear down
    GracefulStop,
    /// Tear down straight away
    Immediate,
}

impl DeleteMode {
    /// Request parameter carrying the delete mode
    pub const PARAM_KEY: &'static str = "deleteMode";

    /// Token selecting a graceful stop
    pub const GRACEFUL_STOP_TOKEN: &'static str = "0";

    /// Parse an operator supplied mode token. Anything that does not name a
    /// graceful stop, including a missing token, means immediate deletion.
    pub fn from_request_param(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(Self::GRACEFUL_STOP_TOKEN) | Some("graceful-stop") => DeleteMode::GracefulStop,
            _ => DeleteMode::Immediate,
        }
    }
}

impl fmt::Display for DeleteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteMode::GracefulStop => write!(f, "graceful-stop"),
            DeleteMode::Immediate => write!(f, "immediate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeardownPhase {
    /// No teardown running. A failed teardown returns here so it can be
    /// retried.
    Idle,
    InFlight,
    Completed,
}

/// Result of claiming the teardown of an agent
pub enum TeardownTicket {
    /// The caller owns this teardown attempt. Carries the channel, if one
    /// was open, so it can be closed outside the agent lock.
    Proceed {
        channel: Option<Box<dyn AgentChannel>>,
    },
    InProgress,
    Completed,
}

impl fmt::Debug for TeardownTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownTicket::Proceed { channel } => f
                .debug_struct("Proceed")
                .field("has_channel", &channel.is_some())
                .finish(),
            TeardownTicket::InProgress => write!(f, "InProgress"),
            TeardownTicket::Completed => write!(f, "Completed"),
        }
    }
}

/// Result of confirming that an agent is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Provisioned,
    NotOnline,
    DeletionInProgress,
}

struct AgentFlags {
    provisioned: bool,
    delete_requested: bool,
    temporarily_offline: bool,
    offline_cause: Option<OfflineCause>,
    teardown: TeardownPhase,
    channel: Option<Box<dyn AgentChannel>>,
}

/// One cloud-provisioned build agent.
///
/// `online` is owned by the scheduler's connectivity tracking and published
/// through a watch channel, so readers never take the agent lock. Every other
/// mutable field sits behind a single per-agent mutex.
pub struct Agent {
    id: AgentId,
    name: String,
    created_at: DateTime<Utc>,
    online: watch::Sender<bool>,
    flags: Mutex<AgentFlags>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags.lock();
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("online", &*self.online.borrow())
            .field("provisioned", &flags.provisioned)
            .field("delete_requested", &flags.delete_requested)
            .field("temporarily_offline", &flags.temporarily_offline)
            .field("teardown", &flags.teardown)
            .field("has_channel", &flags.channel.is_some())
            .finish()
    }
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            online,
            flags: Mutex::new(AgentFlags {
                provisioned: false,
                delete_requested: false,
                temporarily_offline: false,
                offline_cause: None,
                teardown: TeardownPhase::Idle,
                channel: None,
            }),
        }
    }

    pub fn with_channel(name: impl Into<String>, channel: Box<dyn AgentChannel>) -> Self {
        let agent = Self::new(name);
        agent.attach_channel(channel);
        agent
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Called by the scheduler's connectivity tracking
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn is_provisioned(&self) -> bool {
        self.flags.lock().provisioned
    }

    /// Plain setter. Callers must only ever move this false to true once per
    /// agent; use [`Agent::confirm_readiness`] when racing with teardown.
    pub fn set_provisioned(&self, provisioned: bool) {
        self.flags.lock().provisioned = provisioned;
    }

    pub fn is_delete_requested(&self) -> bool {
        self.flags.lock().delete_requested
    }

    pub fn is_temporarily_offline(&self) -> bool {
        self.flags.lock().temporarily_offline
    }

    pub fn offline_cause(&self) -> Option<OfflineCause> {
        self.flags.lock().offline_cause.clone()
    }

    pub fn set_temporarily_offline(&self, offline: bool, cause: Option<OfflineCause>) {
        let mut flags = self.flags.lock();
        flags.temporarily_offline = offline;
        flags.offline_cause = if offline { cause } else { None };
    }

    pub fn teardown_phase(&self) -> TeardownPhase {
        self.flags.lock().teardown
    }

    pub fn has_channel(&self) -> bool {
        self.flags.lock().channel.is_some()
    }

    /// Replace the agent's channel. Returns the previous one, if any.
    pub fn attach_channel(&self, channel: Box<dyn AgentChannel>) -> Option<Box<dyn AgentChannel>> {
        let previous = self.flags.lock().channel.replace(channel);
        if previous.is_some() {
            warn!(agent = %self.name, "Replaced an open channel");
        }
        previous
    }

    /// Whether the scheduler may dispatch new work here
    pub fn accepts_work(&self) -> bool {
        let flags = self.flags.lock();
        self.is_online() && !flags.temporarily_offline && !flags.delete_requested
    }

    /// Set `provisioned` if the agent is online and no deletion has started.
    /// Deletion wins: once `delete_requested` is set this never marks the
    /// agent provisioned.
    pub fn confirm_readiness(&self) -> Readiness {
        let mut flags = self.flags.lock();
        if flags.delete_requested {
            debug!(agent = %self.name, "Readiness ignored, agent is being deleted");
            return Readiness::DeletionInProgress;
        }
        if !self.is_online() {
            return Readiness::NotOnline;
        }
        flags.provisioned = true;
        Readiness::Provisioned
    }

    /// Take the agent out of dispatch and claim its teardown.
    ///
    /// Marks the agent temporarily offline, then sets `delete_requested`,
    /// then hands the open channel to the caller. Only one caller at a time
    /// gets `Proceed`; it must report back through [`Agent::finish_teardown`].
    pub fn begin_teardown(&self, cause: OfflineCause) -> TeardownTicket {
        let mut flags = self.flags.lock();
        if !flags.temporarily_offline || flags.offline_cause.is_none() {
            flags.offline_cause = Some(cause);
        }
        flags.temporarily_offline = true;

        match flags.teardown {
            TeardownPhase::InFlight => TeardownTicket::InProgress,
            TeardownPhase::Completed => TeardownTicket::Completed,
            TeardownPhase::Idle => {
                flags.delete_requested = true;
                flags.teardown = TeardownPhase::InFlight;
                TeardownTicket::Proceed {
                    channel: flags.channel.take(),
                }
            }
        }
    }

    /// Release the teardown claim. A failed attempt goes back to idle with
    /// the agent still offline and delete-requested.
    pub fn finish_teardown(&self, deprovisioned: bool) {
        let mut flags = self.flags.lock();
        flags.teardown = if deprovisioned {
            TeardownPhase::Completed
        } else {
            TeardownPhase::Idle
        };
    }

    /// Delete requested but not being torn down and not yet deprovisioned
    pub fn needs_teardown_retry(&self) -> bool {
        let flags = self.flags.lock();
        flags.delete_requested && flags.teardown == TeardownPhase::Idle
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let flags = self.flags.lock();
        AgentSnapshot {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            online: self.is_online(),
            provisioned: flags.provisioned,
            delete_requested: flags.delete_requested,
            temporarily_offline: flags.temporarily_offline,
            offline_cause: flags.offline_cause.clone(),
            teardown: flags.teardown,
            has_channel: flags.channel.is_some(),
        }
    }
}

/// Point-in-time view of an agent for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub online: bool,
    pub provisioned: bool,
    pub delete_requested: bool,
    pub temporarily_offline: bool,
    pub offline_cause: Option<OfflineCause>,
    pub teardown: TeardownPhase,
    pub has_channel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct NoopChannel;

    #[async_trait]
    impl AgentChannel for NoopChannel {
        async fn close(&self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn new_agent_is_offline_and_unprovisioned() {
        let agent = Agent::new("azure-linux-1");
        assert_eq!(agent.name(), "azure-linux-1");
        assert!(!agent.is_online());
        assert!(!agent.is_provisioned());
        assert!(!agent.is_delete_requested());
        assert!(!agent.is_temporarily_offline());
        assert_eq!(agent.teardown_phase(), TeardownPhase::Idle);
    }

    #[test]
    fn delete_mode_parsing() {
        assert_eq!(
            DeleteMode::from_request_param(Some("0")),
            DeleteMode::GracefulStop
        );
        assert_eq!(
            DeleteMode::from_request_param(Some("graceful-stop")),
            DeleteMode::GracefulStop
        );
        assert_eq!(
            DeleteMode::from_request_param(Some("1")),
            DeleteMode::Immediate
        );
        assert_eq!(DeleteMode::from_request_param(None), DeleteMode::Immediate);
    }

    #[test]
    fn begin_teardown_orders_flags_and_takes_channel() {
        let agent = Agent::with_channel("azure-1", Box::new(NoopChannel));
        assert!(agent.has_channel());

        let ticket = agent.begin_teardown(OfflineCause::new("deleting"));
        match ticket {
            TeardownTicket::Proceed { channel } => assert!(channel.is_some()),
            other => panic!("expected Proceed, got {:?}", other),
        }
        assert!(agent.is_temporarily_offline());
        assert!(agent.is_delete_requested());
        assert!(!agent.has_channel());
        assert_eq!(agent.teardown_phase(), TeardownPhase::InFlight);

        assert!(matches!(
            agent.begin_teardown(OfflineCause::new("again")),
            TeardownTicket::InProgress
        ));
        assert_eq!(agent.offline_cause().unwrap().message, "deleting");
    }

    #[test]
    fn failed_teardown_can_be_retried() {
        let agent = Agent::new("azure-2");
        assert!(matches!(
            agent.begin_teardown(OfflineCause::new("deleting")),
            TeardownTicket::Proceed { .. }
        ));
        agent.finish_teardown(false);

        assert!(agent.needs_teardown_retry());
        assert!(agent.is_temporarily_offline());
        assert!(matches!(
            agent.begin_teardown(OfflineCause::new("retry")),
            TeardownTicket::Proceed { channel: None }
        ));
        agent.finish_teardown(true);

        assert!(!agent.needs_teardown_retry());
        assert!(matches!(
            agent.begin_teardown(OfflineCause::new("late")),
            TeardownTicket::Completed
        ));
    }

    #[test]
    fn readiness_requires_online_and_loses_to_teardown() {
        let agent = Agent::new("azure-3");
        assert_eq!(agent.confirm_readiness(), Readiness::NotOnline);
        assert!(!agent.is_provisioned());

        agent.set_online(true);
        assert_eq!(agent.confirm_readiness(), Readiness::Provisioned);
        assert!(agent.is_provisioned());

        let doomed = Agent::new("azure-4");
        doomed.set_online(true);
        let _ = doomed.begin_teardown(OfflineCause::new("deleting"));
        assert_eq!(doomed.confirm_readiness(), Readiness::DeletionInProgress);
        assert!(!doomed.is_provisioned());
    }

    #[test]
    fn accepts_work_only_when_online_and_not_paused() {
        let agent = Agent::new("azure-5");
        assert!(!agent.accepts_work());

        agent.set_online(true);
        assert!(agent.accepts_work());

        agent.set_temporarily_offline(true, Some(OfflineCause::new("maintenance")));
        assert!(!agent.accepts_work());

        agent.set_temporarily_offline(false, None);
        assert!(agent.offline_cause().is_none());
        assert!(agent.accepts_work());
    }

    #[test]
    fn attach_channel_returns_previous() {
        let agent = Agent::new("azure-7");
        assert!(agent.attach_channel(Box::new(NoopChannel)).is_none());

        let previous = agent
            .attach_channel(Box::new(NoopChannel))
            .expect("previous channel");
        tokio_test::block_on(previous.close()).unwrap();
        assert!(agent.has_channel());
    }

    proptest! {
        #[test]
        fn unknown_tokens_delete_immediately(token in "\\PC*") {
            prop_assume!(token.trim() != "0" && token.trim() != "graceful-stop");
            prop_assert_eq!(DeleteMode::from_request_param(Some(&token)), DeleteMode::Immediate);
        }
    }

    #[test]
    fn snapshot_serializes() {
        let agent = Agent::new("azure-6");
        agent.set_online(true);
        agent.set_provisioned(true);

        let snapshot = agent.snapshot();
        assert!(snapshot.online);
        assert!(snapshot.provisioned);

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: AgentSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
