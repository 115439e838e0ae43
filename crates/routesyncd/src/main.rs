//! Route Synchronization Daemon
//!
//! Main entry point for routesyncd. Opens the rtnetlink socket, seeds
//! the object stores from full route/rule dumps, then runs the
//! reconciliation event loop until shutdown.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - AC-3: Access Enforcement - Requires CAP_NET_ADMIN
//! - SI-4: System Monitoring - Real-time rtnetlink event processing

use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use routesync_rtnl::{AsyncRtnlSocket, RtnlTransport};
use routesyncd::{Manager, Result, RouteSyncError};

/// Kernel route and routing-policy-rule reconciliation daemon.
#[derive(Debug, Parser)]
#[command(name = "routesyncd", version, about)]
struct Args {
    /// Adopt and garbage-collect routes this daemon did not create.
    #[arg(long)]
    manage_foreign_routes: bool,

    /// Adopt and garbage-collect routing-policy rules this daemon did
    /// not create.
    #[arg(long)]
    manage_foreign_rules: bool,

    /// Ceiling on declared objects per network profile.
    #[arg(long, default_value_t = routesyncd::network::DEFAULT_OBJECT_CEILING)]
    object_ceiling: usize,

    /// Log filter, e.g. "info" or "routesyncd=debug".
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_filter)?;

    info!("routesyncd: Starting route synchronization daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("routesyncd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "routesyncd: Daemon exiting with error");
            Err(e.into())
        }
    }
}

/// Initialize structured logging
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| RouteSyncError::InvalidConfig(format!("bad log filter: {e}")))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| RouteSyncError::InvalidConfig(format!("failed to set logger: {e}")))?;
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn run_daemon(args: Args) -> Result<()> {
    let shutdown = setup_signal_handlers();

    let socket = AsyncRtnlSocket::new()?;
    let mut transport = RtnlTransport::new(socket);
    let mut manager = Manager::new(args.manage_foreign_routes, args.manage_foreign_rules);
    manager.object_ceiling = args.object_ceiling;

    // Seed the stores before reconfiguring anything.
    manager.request_dumps(&mut transport).await?;
    info!("routesyncd: Requested initial route and rule dumps");

    manager.run(&mut transport, shutdown).await
}

/// Setup signal handlers for graceful shutdown
fn setup_signal_handlers() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("routesyncd: Received SIGINT/SIGTERM");
            shutdown_flag_clone.store(true, Ordering::Relaxed);
        }
    });

    shutdown_flag
}
