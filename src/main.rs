//! Dependency watchdog entry point
//!
//! The watchdog ships as one binary with two subcommands, typically
//! deployed as two separate workloads:
//!
//! ```bash
//! # Probe tenant API servers and scale dependent workloads
//! dependency-watchdog prober --config-file /etc/watchdog/probe-config.yaml
//!
//! # Weed out crash-looping pods after endpoints recovery
//! dependency-watchdog weeder --config-file /etc/watchdog/weeder-config.yaml
//!
//! # Run with custom log level
//! RUST_LOG=debug dependency-watchdog prober --config-file ...
//! ```

use clap::{Args, Parser, Subcommand};
use dependency_watchdog::leader_election::{self, LeaderElector, LeaseSettings};
use dependency_watchdog::registry::Worker;
use dependency_watchdog::{
    prober, weeder, ClusterController, EndpointsController, WatchdogError,
};
use kube::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Dependency watchdog for Kubernetes control planes
#[derive(Parser, Debug)]
#[command(name = "dependency-watchdog")]
#[command(version, about = "Watchdog that reacts to availability of control-plane dependencies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe tenant API servers and scale dependent workloads on
    /// reachability transitions
    Prober(ControllerArgs),

    /// Watch service endpoints and delete crash-looping dependent pods
    /// once the endpoints recover
    Weeder(ControllerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Path of the controller configuration file
    #[arg(long)]
    config_file: PathBuf,

    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    info!("Starting dependency watchdog");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    match cli.command {
        Command::Prober(args) => run_prober(client, args).await,
        Command::Weeder(args) => run_weeder(client, args).await,
    }
}

/// Shutdown token cancelled on the first interrupt signal. It reaches the
/// lease claim loop too, so a standby replica shuts down promptly instead
/// of waiting out another claim attempt.
fn shutdown_token() -> CancellationToken {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
        });
    }
    shutdown
}

async fn run_prober(client: Client, args: ControllerArgs) -> anyhow::Result<()> {
    // Construction-time validation; an invalid config refuses to start
    let config = prober::load_config(&args.config_file)?;
    info!(
        dependents = config.dependent_resource_infos.len(),
        "Loaded probe configuration"
    );

    let shutdown = shutdown_token();
    // A stalled prober leader leaves a recovering control plane scaled
    // down, so its lease fails over on the fast cadence
    let elector = match acquire_lease(
        &client,
        &args,
        "dependency-watchdog-prober-leader",
        LeaseSettings::fast_failover(),
        &shutdown,
    )
    .await
    {
        Ok(elector) => elector,
        Err(WatchdogError::Cancelled) => {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let controller = Arc::new(ClusterController::new(client, config));
    let manager = controller.manager().clone();

    let controller_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Cluster controller error: {}", e);
            }
        })
    };
    let renew_handle = tokio::spawn(renew_loop(elector.clone()));

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutting down");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("Cluster controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Drain all probers before giving up the lease
    for worker in manager.get_all_workers() {
        manager.unregister(&worker.key());
    }
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Dependency watchdog prober shutting down");
    Ok(())
}

async fn run_weeder(client: Client, args: ControllerArgs) -> anyhow::Result<()> {
    let config = weeder::load_config(&args.config_file)?;
    info!(
        services = config.services_and_dependant_selectors.len(),
        "Loaded weeder configuration"
    );

    let shutdown = shutdown_token();
    // A weeder takeover gap only postpones pod deletions that the next
    // endpoints transition re-triggers, so the relaxed cadence is enough
    let elector = match acquire_lease(
        &client,
        &args,
        "dependency-watchdog-weeder-leader",
        LeaseSettings::relaxed(),
        &shutdown,
    )
    .await
    {
        Ok(elector) => elector,
        Err(WatchdogError::Cancelled) => {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let controller = Arc::new(EndpointsController::new(client, config));
    let manager = controller.manager().clone();

    let controller_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Endpoints controller error: {}", e);
            }
        })
    };
    let renew_handle = tokio::spawn(renew_loop(elector.clone()));

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutting down");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("Endpoints controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    for worker in manager.get_all_workers() {
        manager.unregister(&worker.key());
    }
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Dependency watchdog weeder shutting down");
    Ok(())
}

/// Acquire the named leader lease when leader election is enabled.
async fn acquire_lease(
    client: &Client,
    args: &ControllerArgs,
    lease_name: &str,
    settings: LeaseSettings,
    shutdown: &CancellationToken,
) -> dependency_watchdog::Result<Option<Arc<LeaderElector>>> {
    if !args.leader_election {
        return Ok(None);
    }
    let namespace = leader_election::detect_namespace(&args.leader_election_namespace);
    info!("Leader election namespace: {}", namespace);
    let elector = LeaderElector::new(client.clone(), &namespace, lease_name, settings);
    elector.acquire(shutdown).await?;
    Ok(Some(Arc::new(elector)))
}

/// Periodic lease renewal (no-op future when leader election is disabled)
async fn renew_loop(elector: Option<Arc<LeaderElector>>) {
    match elector {
        Some(e) => loop {
            tokio::time::sleep(e.renew_interval()).await;
            match e.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    error!("Lost leader lease");
                    break;
                }
                Err(err) => {
                    error!("Failed to renew leader lease: {}", err);
                    break;
                }
            }
        },
        None => std::future::pending::<()>().await,
    }
}
