//! Command-line interface for the daemon.

use clap::Parser;
use std::path::PathBuf;

/// Autonomous ticket-dispatch daemon with typed worker pools.
#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(about = "dispatchd - pull tickets from the tracker and execute them in parallel", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Project directory to dispatch tickets for
    #[arg(long, value_name = "DIR")]
    pub project_dir: PathBuf,

    /// Path to daemon_config.json (built-in defaults when omitted)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Control plane HTTP port (overrides config)
    #[arg(long, value_name = "PORT")]
    pub control_port: Option<u16>,

    /// Seconds between dispatch rounds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    pub poll_interval: Option<u64>,

    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}
