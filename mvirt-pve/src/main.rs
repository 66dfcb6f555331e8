//! mvirt-pve: Proxmox provider daemon.
//!
//! This daemon:
//! - Reads VirtualMachine, ProviderConfig and Secret records from a data directory
//! - Authenticates against the Proxmox API named by each ProviderConfig
//! - Creates, updates and deletes QEMU VMs to match the declarations
//! - Writes status and conditions back to the declarations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_pve::{Agent, AgentConfig, FileStore, Outcome, SessionCache, VmConnector};

/// mvirt Proxmox provider
#[derive(Parser, Debug)]
#[command(name = "mvirt-pve", version, about)]
struct Args {
    /// Directory holding virtualmachines/, providerconfigs/ and secrets/
    #[arg(short, long, default_value = "/var/lib/mvirt-pve")]
    data_dir: PathBuf,

    /// Resync interval in seconds
    #[arg(long, default_value = "30")]
    resync_interval: u64,

    /// Timeout for a single reconciliation in seconds
    #[arg(long, default_value = "120")]
    reconcile_timeout: u64,

    /// Initial requeue delay after a failure in seconds
    #[arg(long, default_value = "1")]
    backoff_base: u64,

    /// Maximum requeue delay in seconds
    #[arg(long, default_value = "300")]
    backoff_max: u64,

    /// Reuse Proxmox sessions for this many seconds (0 = new session per reconciliation)
    #[arg(long, default_value = "0")]
    session_ttl: u64,

    /// Run a single reconciliation pass and exit
    #[arg(long)]
    once: bool,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            resync_interval: Duration::from_secs(self.resync_interval.max(1)),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout.max(1)),
            backoff_base: Duration::from_secs(self.backoff_base),
            backoff_max: Duration::from_secs(self.backoff_max),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_pve=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(data_dir = %args.data_dir.display(), "Starting mvirt-pve");

    let store = Arc::new(
        FileStore::open(&args.data_dir)
            .await
            .context("Failed to open data directory")?,
    );
    let sessions = Arc::new(SessionCache::new(Duration::from_secs(args.session_ttl)));
    if sessions.is_enabled() {
        info!(ttl_secs = args.session_ttl, "Proxmox session cache enabled");
    }
    let connector = Arc::new(VmConnector::new(store.clone(), sessions));
    let mut agent = Agent::new(store, connector, args.agent_config());

    if args.once {
        let outcomes = agent.run_once().await?;
        let failed = outcomes.values().filter(|o| **o != Outcome::Synced).count();
        info!(reconciled = outcomes.len(), failed, "Single pass complete");
        if failed > 0 {
            anyhow::bail!("{failed} declaration(s) failed to reconcile");
        }
        return Ok(());
    }

    tokio::select! {
        result = agent.run() => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received interrupt, shutting down");
            Ok(())
        }
    }
}
