//! SQL Relay instance launcher
//!
//! Starts the listener, the initial connection daemons (apportioned
//! across connect strings by metric weight), and the scaler.

use clap::Parser;
use sqlrelay_common::{telemetry, InstanceConfig};
use sqlrelay_scaler::start;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sqlr-start")]
#[command(about = "SQL Relay launcher - starts listener, connections, and scaler")]
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

    if config.id == "sqlrelay" {
        warn!("using the default instance id");
    }

    let instance = start::launch(&config, args.config.as_deref())?;
    info!(
        instance = %config.id,
        listener = instance.listener.id(),
        daemons = instance.daemons.len(),
        scaler = instance.scaler.as_ref().map(|c| c.id()),
        "instance started"
    );
    Ok(())
}
