//! SQL Relay scaler daemon
//!
//! Watches the rendezvous counters and grows or shrinks the connection
//! daemon fleet. Normally spawned by sqlr-start when dynamic scaling is
//! enabled.

use clap::Parser;
use sqlrelay_common::{telemetry, InstanceConfig};
use sqlrelay_scaler::scaler::{install_signal_handlers, Scaler};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sqlr-scaler")]
#[command(about = "SQL Relay scaler - maintains the connection daemon fleet")]
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
        "starting scaler"
    );

    let mut scaler = match Scaler::new(config, args.config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "scaler failed to start");
            return Err(e.into());
        }
    };
    scaler.run()?;
    Ok(())
}
