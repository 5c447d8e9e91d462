//! `discode` — bridge daemon binary.
//!
//! Loads configuration, wires the daemon's components, runs the C12
//! bootstrap sequence (hook install, channel map, hook/stream servers),
//! and waits for a shutdown signal. CLI/tracing/signal shape grounded in
//! the teacher's `main.rs`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use discode::bootstrap;
use discode::config::{default_home_dir, Config};
use discode::daemon::{new_shutdown_token, Daemon};
use discode::stream::default_socket_name;
use discode::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "discode", about = "Bridge daemon for local AI coding agents", version, long_about = None)]
struct Cli {
    /// Directory holding `config.json`/`state.json`/`daemon.pid`/etc.
    ///
    /// Defaults to `~/.discode`.
    #[arg(long)]
    home: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the hook server's HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("discode daemon bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let home_dir = match args.home {
        Some(home) => home,
        None => default_home_dir()?,
    };
    std::fs::create_dir_all(&home_dir)?;

    let config_path = home_dir.join("config.json");
    let mut config = Config::load(&config_path)?;
    config.apply_credential_overlay();
    if let Some(port) = args.port {
        config.hook_server_port = port;
    }
    info!(home = %home_dir.display(), port = config.hook_server_port, "configuration loaded");

    let daemon = Daemon::build(config, &home_dir).await?;
    info!("daemon components wired");

    let cancel = new_shutdown_token();
    let handles = bootstrap::run(&daemon, default_socket_name(), cancel.clone()).await?;
    info!("bootstrap complete, daemon ready");

    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    cancel.cancel();

    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    shutdown_with_timeout(daemon, handles).await;
    info!("discode daemon shut down");
    Ok(())
}

/// Maximum time to wait for graceful shutdown before force-exiting.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn shutdown_with_timeout(mut daemon: Daemon, handles: bootstrap::BootstrapHandles) {
    let shutdown_fut = async {
        daemon.abort_background_tasks();

        if let Ok(Err(err)) = handles.hooks.await {
            error!(%err, "hook server exited with error during shutdown");
        }
        let _ = handles.stream.await;
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_fut)
        .await
        .is_err()
    {
        error!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "graceful shutdown timed out — exiting"
        );
    }
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
