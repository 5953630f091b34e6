use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bulwark::config::BulwarkConfig;
use bulwark::grpc::GrpcServer;
use bulwark::Guard;

/// Rate limiting and brute-force protection service.
#[derive(Parser, Debug)]
#[command(name = "bulwark", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long, global = true)]
    grpc_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the gRPC service (default)
    Serve,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = BulwarkConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: BulwarkConfig) -> anyhow::Result<()> {
    info!("Starting Bulwark");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        failure_mode = ?config.rate_limiting.failure_mode,
        ban_threshold = config.brute_force.ban_threshold,
        "Configuration loaded"
    );

    let addr = config.server.grpc_addr;
    let guard = Arc::new(Guard::in_memory(config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = guard.sweeper().spawn(shutdown_rx);

    let grpc_server = GrpcServer::new(addr, guard);
    let result = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Retention sweeper did not stop cleanly");
    }

    result?;
    info!("Bulwark stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
