use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::RatekeeperConfig;
use ratekeeper::http::HttpServer;
use ratekeeper::ratelimit::build_backend;

/// Rate-limited HTTP reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "RATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides `server.listen_addr`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream base URL, overrides `upstream.url`
    #[arg(long)]
    upstream: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Ratekeeper gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream.url = upstream;
    }
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %config.upstream.url,
        route_prefix = %config.server.route_prefix,
        "Configuration loaded"
    );

    // Initialize the admission backend
    let limiter = build_backend(&config.rate_limiting).await?;
    info!(backend = limiter.name(), "Rate limiter initialized");

    let server = HttpServer::new(&config, limiter)?;

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratekeeper gateway stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
