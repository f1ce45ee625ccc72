//! Marketeer supervisor — boots the selected agent set and drives
//! graceful shutdown.
//!
//! Agent selection comes from `--agents`, `--all-agents`, or the
//! `AGENT_NAME` / `AGENT_NAMES` environment variables. Agents start with a
//! small stagger so a restart does not stampede the broker. SIGINT or
//! SIGTERM stops every agent with a bounded per-agent wait.
//!
//! Exit codes: 0 normal, 1 misconfiguration, 2 schema init failure.

use clap::Parser;
use marketeer_agents::{
    ALL_AGENT_IDS, AgentDeps, AuthIntegrationAgent, BrandProjectAgent, ContentAdAgent,
    ContentCreationAgent, ContentStrategyAgent,
};
use marketeer_core::broker::{Broker, MemoryBroker};
use marketeer_core::cache::MemoryCache;
use marketeer_core::config::{AppConfig, agent_selection_from_env};
use marketeer_core::runtime::Agent;
use marketeer_core::store::Store;
use marketeer_core::vault::CredentialVault;
use marketeer_core::webhooks::{HttpWebhookTransport, WebhookDispatcher};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const STOP_WAIT_PER_AGENT: Duration = Duration::from_secs(5);

/// Marketeer: multi-agent marketing automation.
#[derive(Parser, Debug)]
#[command(name = "marketeer", version, about, long_about = None)]
struct Cli {
    /// Comma-separated agent ids to run
    #[arg(long, value_delimiter = ',')]
    agents: Vec<String>,

    /// Run every agent
    #[arg(long)]
    all_agents: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Platform rate-limit file
    #[arg(long, default_value = "integrations.yaml")]
    integrations: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,
}

fn selected_agents(cli: &Cli) -> Vec<String> {
    if cli.all_agents {
        return ALL_AGENT_IDS.iter().map(|s| s.to_string()).collect();
    }
    if !cli.agents.is_empty() {
        return cli.agents.clone();
    }
    agent_selection_from_env()
}

fn build_agent(
    agent_id: &str,
    deps: &AgentDeps,
    webhooks: &Arc<WebhookDispatcher>,
) -> Option<Box<dyn Agent>> {
    match agent_id {
        AuthIntegrationAgent::AGENT_ID => {
            Some(Box::new(AuthIntegrationAgent::new(deps, webhooks.clone())))
        }
        BrandProjectAgent::AGENT_ID => {
            Some(Box::new(BrandProjectAgent::new(deps, webhooks.clone())))
        }
        ContentStrategyAgent::AGENT_ID => Some(Box::new(ContentStrategyAgent::new(deps))),
        ContentCreationAgent::AGENT_ID => Some(Box::new(ContentCreationAgent::new(deps))),
        ContentAdAgent::AGENT_ID => Some(Box::new(ContentAdAgent::new(deps))),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let agent_ids = selected_agents(&cli);
    if agent_ids.is_empty() {
        error!("no agents selected: pass --agents, --all-agents, or set AGENT_NAME(S)");
        return ExitCode::from(1);
    }
    for agent_id in &agent_ids {
        if !ALL_AGENT_IDS.contains(&agent_id.as_str()) {
            error!(agent = %agent_id, "unknown agent id (known: {ALL_AGENT_IDS:?})");
            return ExitCode::from(1);
        }
    }

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration failed to load");
            return ExitCode::from(1);
        }
    };
    if cli.integrations.exists()
        && let Err(e) = config.load_rate_limits(&cli.integrations)
    {
        error!(error = %e, "integrations.yaml failed to load");
        return ExitCode::from(1);
    }

    let vault = match CredentialVault::from_env() {
        Ok(vault) => Arc::new(vault),
        Err(e) => {
            error!(error = %e, "credential vault cannot start");
            return ExitCode::from(1);
        }
    };

    // Schema init failures are distinct from other misconfiguration.
    let store = match Store::open(config.database_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "schema init failed");
            return ExitCode::from(2);
        }
    };

    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    if let Err(e) = broker.connect().await {
        error!(error = %e, "broker connection failed");
        return ExitCode::from(1);
    }

    let deps = AgentDeps {
        broker: broker.clone(),
        cache: Arc::new(MemoryCache::new()),
        store: store.clone(),
        vault,
        config: Arc::new(config.clone()),
    };
    let webhooks = Arc::new(WebhookDispatcher::new(
        store,
        Arc::new(HttpWebhookTransport::new()),
    ));

    let mut agents: Vec<Box<dyn Agent>> = Vec::new();
    for agent_id in &agent_ids {
        match build_agent(agent_id, &deps, &webhooks) {
            Some(agent) => agents.push(agent),
            None => {
                error!(agent = %agent_id, "unknown agent id");
                return ExitCode::from(1);
            }
        }
    }

    let stagger = Duration::from_millis(config.agents.start_stagger_ms);
    for (i, agent) in agents.iter().enumerate() {
        if i > 0 {
            // Avoid a broker-connect thundering herd on restart.
            tokio::time::sleep(stagger).await;
        }
        if let Err(e) = agent.start().await {
            error!(agent = %agent.agent_id(), error = %e, "agent failed to start");
            shutdown(&agents).await;
            return ExitCode::from(1);
        }
        info!(agent = %agent.agent_id(), "started");
    }
    info!(count = agents.len(), "all agents running");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown(&agents).await;

    if let Err(e) = broker.disconnect().await {
        warn!(error = %e, "broker disconnect failed");
    }
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn shutdown(agents: &[Box<dyn Agent>]) {
    for agent in agents.iter().rev() {
        match tokio::time::timeout(STOP_WAIT_PER_AGENT, agent.stop()).await {
            Ok(Ok(())) => info!(agent = %agent.agent_id(), "stopped"),
            Ok(Err(e)) => warn!(agent = %agent.agent_id(), error = %e, "stop failed"),
            Err(_) => warn!(agent = %agent.agent_id(), "stop timed out"),
        }
    }
}
