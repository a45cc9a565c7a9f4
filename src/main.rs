//! dispatchd entry point.
//!
//! Thin composition layer: parse arguments, initialize logging, wire up
//! signal handling, and hand control to the daemon. Exit codes: 0 on a
//! clean stop, 1 on fatal startup errors, 130 when interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use dispatchd::agent::ClaudeCliRuntime;
use dispatchd::cli::Cli;
use dispatchd::config::DaemonConfig;
use dispatchd::daemon::Daemon;
use dispatchd::subprocess::SubprocessManager;

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut config = match &cli.config {
        Some(path) if path.exists() => match DaemonConfig::from_file(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                error!("Failed to load config: {:#}", e);
                return 1;
            }
        },
        Some(path) => {
            error!("Config file not found: {}", path.display());
            return 1;
        }
        None => {
            info!("Using built-in default config");
            DaemonConfig::standard()
        }
    };

    if let Some(port) = cli.control_port {
        config.control_port = port;
    }
    if let Some(interval) = cli.poll_interval {
        config.poll_interval = interval;
    }

    let subprocess = SubprocessManager::production();
    let runtime = Arc::new(ClaudeCliRuntime::new(subprocess.clone()));
    match runtime.check_availability().await {
        Ok(true) => {}
        Ok(false) => warn!("claude CLI not found on PATH; agent sessions will fail"),
        Err(e) => warn!("Could not probe claude CLI: {}", e),
    }

    let daemon = Arc::new(Daemon::new(
        cli.project_dir.clone(),
        config,
        runtime,
        subprocess,
    ));

    spawn_signal_listener(Arc::clone(&daemon), cli.config.clone());

    match daemon.run().await {
        Ok(()) if daemon.was_interrupted() => 130,
        Ok(()) => 0,
        Err(e) => {
            error!("Fatal error: {}", e);
            1
        }
    }
}

/// SIGINT/SIGTERM trigger graceful shutdown; SIGHUP reloads the config
/// file in place.
fn spawn_signal_listener(daemon: Arc<Daemon>, config_path: Option<PathBuf>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm, mut sighup) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(i), Ok(t), Ok(h)) => (i, t, h),
            _ => {
                warn!("Failed to install signal handlers");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    daemon.request_shutdown();
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    daemon.request_shutdown();
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading config");
                    daemon.reload_config(config_path.as_deref());
                }
            }
        }
    });
}
