//! Logging setup
//!
//! Structured logging with env-filter overrides and optional JSON output
//! for production deployments.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;

/// Initialize the tracing subscriber for one process
pub fn init(cfg: &TelemetryConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cfg.json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::debug!(level = %cfg.log_level, json = cfg.json_logs, "logging initialized");
}
