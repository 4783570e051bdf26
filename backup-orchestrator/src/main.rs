//! Backup Orchestrator - Main entry point

use anyhow::{Context, Result};
use backup_orchestrator::{
    api, config::Config, daemon::shutdown::ShutdownCoordinator, utils, ws, Orchestrator,
};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    api::health::init_start_time();

    tracing::info!(
        "Starting backup-orchestrator v{} (engine: {}, default target: {})",
        env!("CARGO_PKG_VERSION"),
        config.engine.program.display(),
        config.targets.default
    );
    for (target, root) in config.targets.roots() {
        tracing::info!(target = %target, root = %root.display(), "Backup target");
    }

    let port = args.port.unwrap_or(config.server.port);
    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let addr = SocketAddr::new(ip, port);

    let events = ws::EventBus::new();
    let orchestrator = Orchestrator::new(&config, events.clone());
    let app = api::create_router(api::AppState::new(orchestrator.clone(), events));

    let shutdown = ShutdownCoordinator::new();
    let signal_watcher = shutdown.clone();
    tokio::spawn(async move {
        signal_watcher.wait_for_signal().await;
    });

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);
    tracing::info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let token = shutdown.token();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    });

    shutdown.cancelled().await;

    // Abort the active job before the process goes away.
    shutdown.shutdown(&orchestrator).await;

    // Open WebSocket clients can hold the server; don't wait forever.
    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
