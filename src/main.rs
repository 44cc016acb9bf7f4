#![forbid(unsafe_code)]

//! `botdock`: bot deployment and pairing server binary.
//!
//! Bootstraps configuration and the database, reconciles persisted bot
//! records against reality, then serves the HTTP API and the IPC socket
//! for `botdock-ctl` while the process monitor runs in the background.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use botdock::config::GlobalConfig;
use botdock::ipc::server::spawn_ipc_server;
use botdock::orchestrator::monitor::{spawn_process_monitor, ProcessMonitor};
use botdock::pairing::bridge::BridgeTransport;
use botdock::persistence::db;
use botdock::state::AppState;
use botdock::{api, AppError, Result};

/// Environment variable holding the optional IPC shared secret.
const IPC_TOKEN_ENV: &str = "BOTDOCK_IPC_TOKEN";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "botdock", about = "Bot deployment and pairing server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port from the config file.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("botdock server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path()).await?);
    info!("database connected");

    // ── Build shared application state ──────────────────
    let transport = Arc::new(BridgeTransport::new(config.pairing.bridge_command.clone())?);
    let ipc_auth_token = std::env::var(IPC_TOKEN_ENV).ok().filter(|t| !t.is_empty());
    let state = Arc::new(
        AppState::new(Arc::clone(&config), db, transport).with_ipc_auth_token(ipc_auth_token),
    );

    // ── Reconcile records left behind by a previous run ──
    let monitor = ProcessMonitor::new(Arc::clone(&state));
    if let Some(report) = monitor.run_tick().await {
        info!(
            corrected = report.corrected.len(),
            deployed = report.deployed.len(),
            failed = report.failed.len(),
            "startup reconciliation complete"
        );
    }

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let monitor_handle = spawn_process_monitor(monitor, ct.clone());

    let ipc_handle = match spawn_ipc_server(Arc::clone(&state), ct.clone()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(%err, "IPC server unavailable; continuing with HTTP only");
            None
        }
    };

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = api::serve(http_state, http_ct.clone()).await {
            error!(%err, "HTTP API failed");
            http_ct.cancel();
        }
    });

    info!("botdock ready");

    // ── Wait for shutdown signal ────────────────────────
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        () = ct.cancelled() => warn!("shutting down after a fatal task error"),
    }
    ct.cancel();

    // ── Graceful shutdown ───────────────────────────────
    state.pairing.cancel_all().await;
    state.deployer.stop_all().await;

    let _ = tokio::join!(monitor_handle, http_handle);
    if let Some(handle) = ipc_handle {
        let _ = handle.await;
    }
    info!("botdock shut down");

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
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
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
