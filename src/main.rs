#![forbid(unsafe_code)]

//! `git-gateway` server binary.
//!
//! Loads configuration, initializes the Linguist color registry, and
//! serves the smart-HTTP transport until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use git_gateway::config::GlobalConfig;
use git_gateway::gateway::{GatewaySettings, ProtocolGateway};
use git_gateway::http::{self, HttpState};
use git_gateway::linguist;
use git_gateway::process::ProcessRunner;
use git_gateway::sidecar::{LocalSocketTransport, SidecarOperations};
use git_gateway::storage::StorageResolver;
use git_gateway::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "git-gateway", about = "Git smart-protocol gateway", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("git-gateway server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    info!(
        storages = config.storages.len(),
        max_concurrent_processes = config.max_concurrent_processes,
        "configuration loaded"
    );

    if let Some(path) = &config.linguist.languages_json {
        linguist::load_colors(path)?;
    }

    // ── Build shared state ──────────────────────────────
    let resolver = Arc::new(StorageResolver::new(config.storages.clone()));
    let max_processes = usize::try_from(config.max_concurrent_processes)
        .map_err(|err| AppError::Config(format!("max_concurrent_processes: {err}")))?;
    let runner = ProcessRunner::new(max_processes, config.kill_grace());
    let gateway = ProtocolGateway::new(
        GatewaySettings::from(&config),
        Arc::clone(&resolver) as _,
        runner,
    );
    let operations = SidecarOperations::new(
        resolver,
        Arc::new(LocalSocketTransport::from_config(&config.sidecar)),
    );

    let ct = CancellationToken::new();
    let state = Arc::new(HttpState {
        gateway: Arc::new(gateway),
        operations: Arc::new(operations),
        shutdown: ct.clone(),
    });

    // ── Start transport ─────────────────────────────────
    let http_ct = ct.clone();
    let bind = config.listen_addr;
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve_http(state, bind, http_ct).await {
            error!(%err, "HTTP transport failed");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Err(err) = http_handle.await {
        error!(%err, "HTTP transport task panicked");
    }
    info!("git-gateway shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
