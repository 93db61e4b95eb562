use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use apiguard::config::GuardConfig;
use apiguard::ratelimit::PolicyRouter;
use apiguard::server::HttpServer;

/// Rate limited API front for the NFT marketplace.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Apiguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GuardConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        deployment = ?config.storage.deployment,
        "Configuration loaded"
    );

    // Stores are built once here and owned by the router from now on.
    let table = config.policy_table()?;
    let (local, backends) = config.build_backends(&table)?;
    let limiter = Arc::new(PolicyRouter::new(table, backends)?);
    for policy in limiter.table().policies() {
        info!(
            policy = %policy.name,
            max_requests = policy.max_requests,
            window_seconds = policy.window_seconds,
            storage = %policy.storage,
            "Rate limit policy loaded"
        );
    }

    let purge_every = Duration::from_secs(config.storage.purge_interval_secs.max(1));
    let purge = tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            let purged = local.purge_expired();
            if purged > 0 {
                debug!(purged = purged, "Purged expired local counters");
            }
        }
    });

    let server = HttpServer::new(config.server.listen_addr, limiter);
    server.serve_with_shutdown(shutdown_signal()).await?;

    purge.abort();
    info!("Apiguard stopped");
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
