//! SQL Relay listener daemon
//!
//! Listens for client connections and hands each one to an available
//! connection daemon, or queues it until one is available. Normally
//! spawned by sqlr-start.

use clap::Parser;
use sqlrelay_common::{telemetry, InstanceConfig};
use sqlrelay_listener::listener::{install_signal_handlers, Listener};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sqlr-listener")]
#[command(about = "SQL Relay listener - accepts clients and dispatches them to daemons")]
struct Args {
    /// Instance id
    #[arg(long, env = "SQLR_ID")]
    id: Option<String>,

    /// Path to the instance TOML config
    #[arg(long, env = "SQLR_CONFIG")]
    config: Option<std::path::PathBuf>,
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
        "starting listener"
    );

    let mut listener = match Listener::new(config) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "listener failed to start");
            return Err(e.into());
        }
    };
    listener.run()?;
    Ok(())
}
