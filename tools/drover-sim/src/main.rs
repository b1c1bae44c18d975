//! # Drover Simulator
//!
//! Provisions a handful of agents against in-memory collaborators, waits for
//! them to come online, then deletes them and prints what is left.

use anyhow::Context;
use clap::Parser;
use drover_core::{Agent, LifecycleConfig, BUILD_INFO};
use lifecycle_engine::in_memory::{
    CallLog, InMemoryChannel, InMemoryCloudProvider, InMemoryScheduler, StaticPermissions,
};
use lifecycle_engine::{AgentLifecycle, AgentRegistry, DeletionReconciler, ReconcilerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "drover-sim")]
#[command(about = "Drover simulator - provision and retire cloud agents in memory")]
#[command(version = drover_core::VERSION)]
struct Cli {
    /// Number of agents to provision
    #[arg(long, default_value_t = 3)]
    agents: usize,

    /// Executor slots per agent
    #[arg(long, default_value_t = 2)]
    executors: usize,

    /// Delete mode token ("0" stops running jobs first)
    #[arg(long, default_value = "0")]
    delete_mode: String,

    /// Number of deprovision calls the cloud provider should fail
    #[arg(long, default_value_t = 0)]
    fail_deprovision: usize,

    /// Delay before the scheduler sees the agents online
    #[arg(long, default_value_t = 200)]
    online_after_ms: u64,

    /// JSON lifecycle configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<LifecycleConfig> {
    let config = match path {
        Some(path) => LifecycleConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LifecycleConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    info!("Starting {}", BUILD_INFO);

    let log = CallLog::new();
    let scheduler = Arc::new(InMemoryScheduler::new());
    let cloud = Arc::new(InMemoryCloudProvider::new(log.clone()));
    let registry = AgentRegistry::new();
    let lifecycle = Arc::new(AgentLifecycle::new(
        registry.clone(),
        Arc::new(StaticPermissions::allow_all()),
        scheduler.clone(),
        cloud.clone(),
        &config,
    )?);

    let reconciler = Arc::new(DeletionReconciler::new(
        registry.clone(),
        lifecycle.coordinator(),
        ReconcilerConfig::from(&config),
    ));
    let reconciler_shutdown = reconciler.shutdown_token();
    let reconciler_handle = reconciler.start();

    let names: Vec<String> = (0..cli.agents).map(|i| format!("sim-agent-{}", i)).collect();
    for name in &names {
        let channel = InMemoryChannel::new(name.clone(), log.clone());
        registry.register(Agent::with_channel(name.clone(), Box::new(channel)));
        scheduler.add_executors(name, cli.executors);
    }
    let agents = registry.list();

    // Provisioning workflows park until their agent is online
    let cancel = CancellationToken::new();
    let waits: Vec<_> = names
        .iter()
        .cloned()
        .map(|name| {
            let lifecycle = lifecycle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lifecycle.wait_until_online(&name, &cancel).await })
        })
        .collect();

    let online_after = Duration::from_millis(cli.online_after_ms);
    let connectivity = {
        let agents = agents.clone();
        tokio::spawn(async move {
            tokio::time::sleep(online_after).await;
            for agent in agents {
                agent.set_online(true);
            }
        })
    };

    for wait in waits {
        wait.await.context("readiness task panicked")??;
    }
    connectivity.await.context("connectivity task panicked")?;

    for agent in &agents {
        scheduler.dispatch(agent, format!("{}-build", agent.name()));
    }

    cloud.fail_times(cli.fail_deprovision);

    for name in &names {
        match lifecycle
            .handle_delete_request(name, Some(&cli.delete_mode))
            .await
        {
            Ok(outcome) => info!(agent = %name, ?outcome, "Delete request finished"),
            Err(e) if e.is_teardown_failure() => {
                warn!(agent = %name, error = %e, "Delete request failed, reconciler will retry")
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Give the reconciler a few cycles to clean up failed deletions
    let settle = config.reconcile_interval() * 3;
    let _ = tokio::time::timeout(settle, async {
        while !registry.pending_deletions().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    reconciler_shutdown.cancel();
    reconciler_handle.await.context("reconciler task panicked")?;

    println!("{}", serde_json::to_string_pretty(&registry.snapshots())?);
    info!(
        deprovision_calls = cloud.deprovision_calls(),
        cancelled_jobs = scheduler.cancelled_jobs().len(),
        remaining_agents = registry.len(),
        "Simulation finished"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["drover-sim"]);
        assert_eq!(cli.agents, 3);
        assert_eq!(cli.delete_mode, "0");
        assert_eq!(cli.fail_deprovision, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "drover-sim",
            "--agents",
            "5",
            "--delete-mode",
            "1",
            "--fail-deprovision",
            "2",
        ]);
        assert_eq!(cli.agents, 5);
        assert_eq!(cli.delete_mode, "1");
        assert_eq!(cli.fail_deprovision, 2);
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Some(&PathBuf::from("/nonexistent/drover.json"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/drover.json"));
    }
}
