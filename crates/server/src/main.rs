mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use grab_core::config::load_dotenv;
use grab_core::GrabConfig;
use grab_scheduler::{NvidiaSmiMonitor, ResourceMonitor, StaticMonitor};
use tracing::info;

use crate::cli::DaemonArgs;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let args = DaemonArgs::parse();
    let config = GrabConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gpu-grabd starting");
    config.log_summary();

    let monitor: Arc<dyn ResourceMonitor> = match args.dry_run_gpus {
        Some(count) => {
            info!(gpus = count, "dry run: simulating idle gpus");
            Arc::new(StaticMonitor::idle(count))
        }
        None => Arc::new(NvidiaSmiMonitor::new(config.monitor_timeout())),
    };

    grab_server::run_daemon(config, monitor, shutdown_signal()).await
}

// ── Signal handling ──────────────────────────────────────────────────

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }
}
