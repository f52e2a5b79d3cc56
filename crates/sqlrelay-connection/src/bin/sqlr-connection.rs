//! SQL Relay connection daemon
//!
//! Holds one authenticated backend session and serves clients handed off
//! by the listener. Not intended to be run by hand; sqlr-start and the
//! scaler spawn it as needed.

use clap::Parser;
use sqlrelay_common::{telemetry, InstanceConfig};
use sqlrelay_connection::daemon::{install_signal_handlers, Daemon, DaemonOptions};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sqlr-connection")]
#[command(about = "SQL Relay connection daemon - owns one backend database session")]
struct Args {
    /// Instance id
    #[arg(long, env = "SQLR_ID")]
    id: Option<String>,

    /// Path to the instance TOML config
    #[arg(long, env = "SQLR_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Connect string to serve (defaults to the first configured)
    #[arg(long, env = "SQLR_CONNECTIONID")]
    connectionid: Option<String>,

    /// Set when the scaler spawned this daemon; enables the idle TTL
    #[arg(long, default_value = "false")]
    scaler_spawned: bool,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = InstanceConfig::load(args.config.as_deref())?;
    if let Some(id) = args.id {
        config.id = id;
    }
    telemetry::init(&config.telemetry);
    install_signal_handlers()?;

    info!(
        instance = %config.id,
        pid = std::process::id(),
        "starting connection daemon"
    );

    let options = DaemonOptions {
        config,
        connection_id: args.connectionid,
        scaler_spawned: args.scaler_spawned,
    };

    let mut daemon = match Daemon::new(options) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "daemon failed to start");
            return Err(e.into());
        }
    };
    daemon.run()?;
    Ok(())
}
