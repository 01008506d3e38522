//! Container tail watchdog
//!
//! Runs the container tail agent and restarts it whenever its resume
//! marker stops advancing.

use agent_lib::{observability::StructuredLogger, Watchdog, WatchdogConfig};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Container tail watchdog
#[derive(Parser, Debug)]
#[command(name = "container-tail-watchdog")]
#[command(author, version, about = "Restarts the container tail agent when it stalls", long_about = None)]
pub struct Cli {
    /// Resume marker written by the agent
    #[arg(long, env = "WATCHDOG_MARKER", default_value = "/srv/events/since")]
    pub marker: PathBuf,

    /// Seconds without marker progress before the agent is restarted
    #[arg(long, default_value_t = 30)]
    pub stall_timeout: u64,

    /// Seconds between marker checks
    #[arg(long, default_value_t = 1)]
    pub check_interval: u64,

    /// Seconds to wait after SIGINT and after SIGTERM
    #[arg(long, default_value_t = 10)]
    pub grace: u64,

    /// Seconds to wait before restarting the agent
    #[arg(long, default_value_t = 10)]
    pub cooldown: u64,

    /// Host name reported in log lines
    #[arg(long, env = "HOSTNAME", default_value = "unknown")]
    pub hostname: String,

    /// Agent command line
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, default_value = "container-tail")]
    pub command: Vec<String>,
}

impl Cli {
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            marker_path: self.marker.clone(),
            command: self.command.clone(),
            stall_timeout: Duration::from_secs(self.stall_timeout),
            check_interval: Duration::from_secs(self.check_interval.max(1)),
            grace: Duration::from_secs(self.grace),
            cooldown: Duration::from_secs(self.cooldown),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.watchdog_config();
    info!(
        marker = %config.marker_path.display(),
        command = %config.command.join(" "),
        stall_timeout_secs = cli.stall_timeout,
        "Starting watchdog"
    );

    let watchdog = Watchdog::new(config, StructuredLogger::new(cli.hostname));
    tokio::select! {
        result = watchdog.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, stopping agent");
            Ok(())
        }
    }
}
