//! Grimnir Server - the per-station playout runtime as a daemon.
//!
//! Configuration is environment-first (`GRIMNIR_*`, with legacy `RLM_*`
//! aliases); the CLI only overrides the handful of flags useful when
//! running by hand. Configuration errors exit non-zero at boot; everything
//! after boot is recoverable and keeps the process up.

use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use grimnir_core::{bootstrap, start_server, Config};
use tokio::signal;

/// Grimnir Radio playout server.
#[derive(Parser, Debug)]
#[command(name = "grimnir-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "GRIMNIR_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// HTTP port (overrides GRIMNIR_HTTP_PORT).
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Harbor ingest port (overrides GRIMNIR_HARBOR_PORT).
    #[arg(long)]
    harbor_port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Grimnir Server v{}", env!("CARGO_PKG_VERSION"));

    // Unreadable configuration is the one fatal class: exit non-zero here.
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(port) = args.harbor_port {
        config.harbor.port = port;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let http_addr = SocketAddr::new(config.http_bind, config.http_port);

    let services = bootstrap(config)
        .await
        .context("Failed to bootstrap services")?;
    log::info!("Services bootstrapped successfully");

    services
        .start_background_tasks()
        .await
        .context("Failed to start background tasks")?;
    log::info!("Background tasks started");

    let app_state = services.app_state();
    let server_cancel = services.cancel.child_token();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, http_addr, server_cancel).await {
            log::error!("HTTP server error: {e}");
        }
    });
    log::info!("HTTP server started on {http_addr}");

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
