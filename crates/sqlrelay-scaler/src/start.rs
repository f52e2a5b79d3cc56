//! Instance launcher
//!
//! Brings up one deployment in order: the listener (which owns the
//! rendezvous), the initial daemon fleet apportioned across connect
//! strings by metric weight, and finally the scaler when dynamic scaling
//! is enabled.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use sqlrelay_common::{InstanceConfig, InstanceDirs, RelayError, Result};
use tracing::{info, warn};

use crate::scaler::sibling_binary;

/// How many daemons each connect string gets at launch:
/// `ceil(metric * connections / metric_total)`, capped so the fleet
/// never exceeds the configured total
pub fn apportion(cfg: &InstanceConfig) -> Vec<(String, u32)> {
    let connections = cfg.connections.connections;
    let metric_total = cfg.metric_total();
    if metric_total == 0 || connections == 0 {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut started = 0u32;
    for cs in &cfg.connect_strings {
        if started >= connections {
            break;
        }
        if cs.metric == 0 {
            continue;
        }
        let ideal = ((cs.metric as u64 * connections as u64 + metric_total as u64 - 1)
            / metric_total as u64) as u32;
        let count = ideal.min(connections - started);
        if count > 0 {
            out.push((cs.connection_id.clone(), count));
            started += count;
        }
    }
    out
}

/// Processes started by the launcher
pub struct Instance {
    pub listener: Child,
    pub daemons: Vec<Child>,
    pub scaler: Option<Child>,
}

/// Start listener, daemons, and scaler; returns the spawned children
pub fn launch(cfg: &InstanceConfig, config_path: Option<&Path>) -> Result<Instance> {
    info!(instance = %cfg.id, "starting listener");
    let listener = spawn(cfg, config_path, "sqlr-listener", &[])?;

    // The daemons refuse to start until the listener has created the
    // rendezvous segment
    wait_for_rendezvous(cfg)?;

    let mut daemons = Vec::new();
    for (connection_id, count) in apportion(cfg) {
        info!(count, pool = %connection_id, "starting connections");
        for _ in 0..count {
            daemons.push(spawn(
                cfg,
                config_path,
                "sqlr-connection",
                &["--connectionid", &connection_id],
            )?);
        }
    }

    let scaler = if cfg.connections.dynamic_scaling {
        info!("starting scaler");
        Some(spawn(cfg, config_path, "sqlr-scaler", &[])?)
    } else {
        None
    };

    Ok(Instance {
        listener,
        daemons,
        scaler,
    })
}

fn spawn(
    cfg: &InstanceConfig,
    config_path: Option<&Path>,
    binary: &str,
    extra_args: &[&str],
) -> Result<Child> {
    let program: PathBuf = sibling_binary(binary);
    let mut command = Command::new(&program);
    command.arg("--id").arg(&cfg.id);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    command.args(extra_args);
    command.spawn().map_err(|e| {
        RelayError::Internal(format!("failed to start {}: {}", program.display(), e))
    })
}

fn wait_for_rendezvous(cfg: &InstanceConfig) -> Result<()> {
    let dirs = InstanceDirs::new(&cfg.run_dir, &cfg.id);
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if dirs.shm_key_file().exists() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    warn!("listener did not come up in time");
    Err(RelayError::RendezvousError(
        "listener did not create the rendezvous segment".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlrelay_common::config::ConnectStringConfig;

    fn cfg_with_metrics(connections: u32, metrics: &[u32]) -> InstanceConfig {
        let mut cfg = InstanceConfig::default();
        cfg.connections.connections = connections;
        cfg.connections.max_connections = connections.max(30);
        cfg.connect_strings = metrics
            .iter()
            .enumerate()
            .map(|(i, &metric)| ConnectStringConfig {
                connection_id: format!("pool-{}", i),
                metric,
                ..Default::default()
            })
            .collect();
        cfg
    }

    #[test]
    fn single_pool_gets_everything() {
        let cfg = cfg_with_metrics(5, &[1]);
        assert_eq!(apportion(&cfg), vec![("pool-0".to_string(), 5)]);
    }

    #[test]
    fn weighted_pools_round_up_then_cap() {
        let cfg = cfg_with_metrics(5, &[2, 1]);
        // ceil(2*5/3)=4, then pool-1 is capped to the single remaining slot
        assert_eq!(
            apportion(&cfg),
            vec![("pool-0".to_string(), 4), ("pool-1".to_string(), 1)]
        );
    }

    #[test]
    fn zero_metric_pool_is_skipped() {
        let cfg = cfg_with_metrics(4, &[0, 1]);
        assert_eq!(apportion(&cfg), vec![("pool-1".to_string(), 4)]);
    }

    #[test]
    fn zero_metric_total_starts_nothing() {
        let cfg = cfg_with_metrics(4, &[0, 0]);
        assert!(apportion(&cfg).is_empty());
    }
}
